use crate::ipc::helpers::{calc, db_conn, reply, required_str, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use serde_json::json;

fn reports_outcome_comparison(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let rows = reports::outcome_comparison(conn, &degree_id).map_err(calc(req))?;
    Ok(json!({ "degreeId": degree_id, "outcomes": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.outcomeComparison" => reports_outcome_comparison(state, req),
        _ => return None,
    };
    Some(reply(req, result))
}
