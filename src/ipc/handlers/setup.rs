use crate::db;
use crate::error::CalcResult;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Attainment,
    Indirect,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attainment" => Some(Self::Attainment),
            "indirect" => Some(Self::Indirect),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attainment => settings::ATTAINMENT_KEY,
            Self::Indirect => settings::INDIRECT_KEY,
        }
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !n.is_finite() || n < min || n > max {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Attainment => match k.as_str() {
                "nearTargetRatio" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.5, 1.0)?));
                }
                "trendsDefaultLimit" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 60)?));
                }
                _ => return Err(format!("unknown attainment field: {}", k)),
            },
            SetupSection::Indirect => match k.as_str() {
                "defaultRatingMax" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 1.0, 100.0)?));
                }
                "defaultLikertScale" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 2, 11)?));
                }
                _ => return Err(format!("unknown indirect field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Current values of a section, read through the same loader the pipeline uses.
fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> CalcResult<Value> {
    let value = match section {
        SetupSection::Attainment => serde_json::to_value(settings::attainment(conn)?)?,
        SetupSection::Indirect => serde_json::to_value(settings::indirect(conn)?)?,
    };
    Ok(value)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let attainment = match load_section(conn, SetupSection::Attainment) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, &e),
    };
    let indirect = match load_section(conn, SetupSection::Indirect) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, &e),
    };

    ok(
        &req.id,
        json!({
            "attainment": attainment,
            "indirect": indirect
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, &e),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    info!(section = section_raw, "settings updated");
    ok(&req.id, json!({ "ok": true, "section": section_raw, "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
