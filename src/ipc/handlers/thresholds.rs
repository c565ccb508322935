use crate::ipc::helpers::{
    calc, db_conn, optional_bool, optional_outcome_type, optional_str, outcome_type, reply,
    required_f64, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::thresholds::{self, ThresholdInput};
use serde_json::json;

fn threshold_input(req: &Request) -> Result<ThresholdInput, serde_json::Value> {
    Ok(ThresholdInput {
        degree_id: required_str(req, "degreeId")?,
        outcome_type: outcome_type(req, "outcomeType")?,
        level_name: required_str(req, "levelName")?,
        min_percentage: required_f64(req, "minPercentage")?,
        max_percentage: required_f64(req, "maxPercentage")?,
        is_attained: optional_bool(req, "isAttained", false)?,
    })
}

fn thresholds_list(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let outcome_type = optional_outcome_type(req, "outcomeType")?;
    let rows = thresholds::list(conn, &degree_id, outcome_type).map_err(calc(req))?;
    Ok(json!({ "thresholds": rows }))
}

fn thresholds_create(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let input = threshold_input(req)?;
    let t = thresholds::create(conn, &input).map_err(calc(req))?;
    Ok(json!({ "threshold": t }))
}

fn thresholds_update(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "id")?;
    let input = threshold_input(req)?;
    let t = thresholds::update(conn, &id, &input).map_err(calc(req))?;
    Ok(json!({ "threshold": t }))
}

fn thresholds_delete(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "id")?;
    let deleted = thresholds::delete(conn, &id).map_err(calc(req))?;
    Ok(json!({ "deleted": deleted }))
}

fn thresholds_validate_range(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let outcome_type = outcome_type(req, "outcomeType")?;
    let min = required_f64(req, "minPercentage")?;
    let max = required_f64(req, "maxPercentage")?;
    let exclude_id = optional_str(req, "excludeId")?;
    let valid = thresholds::validate_no_overlap(
        conn,
        &degree_id,
        outcome_type,
        min,
        max,
        exclude_id.as_deref(),
    )
    .map_err(calc(req))?;
    Ok(json!({ "valid": valid }))
}

fn thresholds_evaluate(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let outcome_type = outcome_type(req, "outcomeType")?;
    let percentage = required_f64(req, "percentage")?;
    let level = thresholds::evaluate(conn, &degree_id, outcome_type, percentage).map_err(calc(req))?;
    Ok(json!({
        "found": level.is_some(),
        "threshold": level,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "thresholds.list" => thresholds_list(state, req),
        "thresholds.create" => thresholds_create(state, req),
        "thresholds.update" => thresholds_update(state, req),
        "thresholds.delete" => thresholds_delete(state, req),
        "thresholds.evaluate" => thresholds_evaluate(state, req),
        "thresholds.validateRange" => thresholds_validate_range(state, req),
        _ => return None,
    };
    Some(reply(req, result))
}
