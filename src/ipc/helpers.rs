use crate::error::CalcError;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::query::{OrderBy, SortColumns};
use crate::thresholds::OutcomeType;
use rusqlite::Connection;
use serde_json::Value;

/// Handler bodies return the error response itself on failure so `?` can
/// short-circuit straight to the wire.
pub type HandlerResult = Result<Value, Value>;

pub fn reply(req: &Request, result: HandlerResult) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e,
    }
}

pub fn calc(req: &Request) -> impl Fn(CalcError) -> Value + '_ {
    move |e| calc_err(&req.id, &e)
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(err(&req.id, "bad_params", format!("{} must be a string", key), None)),
    }
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("{} must be a number", key), None))
}

pub fn optional_bool(req: &Request, key: &str, default: bool) -> Result<bool, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(err(&req.id, "bad_params", format!("{} must be boolean", key), None)),
    }
}

pub fn optional_i64(req: &Request, key: &str) -> Result<Option<i64>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| err(&req.id, "bad_params", format!("{} must be integer", key), None)),
    }
}

pub fn string_list(req: &Request, key: &str) -> Result<Vec<String>, Value> {
    let Some(items) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", format!("{} must be an array", key), None));
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    err(
                        &req.id,
                        "bad_params",
                        format!("{} must contain non-empty strings", key),
                        None,
                    )
                })
        })
        .collect()
}

pub fn outcome_type(req: &Request, key: &str) -> Result<OutcomeType, Value> {
    let raw = required_str(req, key)?;
    OutcomeType::parse(&raw).map_err(calc(req))
}

pub fn optional_outcome_type(req: &Request, key: &str) -> Result<Option<OutcomeType>, Value> {
    match optional_str(req, key)? {
        None => Ok(None),
        Some(raw) => OutcomeType::parse(&raw).map(Some).map_err(calc(req)),
    }
}

/// Reads `sortBy` / `sortDir` against the endpoint's allow-list.
pub fn order_by(req: &Request, allowed: SortColumns, tiebreak: &'static str) -> Result<OrderBy, Value> {
    let sort_by = optional_str(req, "sortBy")?;
    let sort_dir = optional_str(req, "sortDir")?;
    OrderBy::parse(sort_by.as_deref(), sort_dir.as_deref(), allowed, tiebreak).map_err(calc(req))
}
