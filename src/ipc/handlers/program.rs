use crate::ipc::helpers::{
    calc, db_conn, optional_i64, optional_str, reply, required_str, string_list, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::program_summary;
use crate::settings;
use serde_json::json;

fn program_calculate_summary(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let plo_id = optional_str(req, "ploId")?;
    let summaries = program_summary::calculate_summary(conn, &degree_id, plo_id.as_deref())
        .map_err(calc(req))?;
    Ok(json!({ "summaries": summaries, "period": program_summary::current_period() }))
}

fn program_distribution(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let plo_id = required_str(req, "ploId")?;
    let dist = program_summary::distribution(conn, &degree_id, &plo_id).map_err(calc(req))?;
    Ok(json!(dist))
}

fn program_compare(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_ids = string_list(req, "degreeIds")?;
    let rows = program_summary::compare(conn, &degree_ids).map_err(calc(req))?;
    Ok(json!({ "rows": rows }))
}

fn program_trends(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let plo_id = optional_str(req, "ploId")?;
    let limit = match optional_i64(req, "limit")? {
        Some(n) => n,
        None => settings::attainment(conn).map_err(calc(req))?.trends_default_limit,
    };
    let periods = program_summary::trends(conn, &degree_id, plo_id.as_deref(), limit)
        .map_err(calc(req))?;
    Ok(json!({ "periods": periods, "limit": limit }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "program.calculateSummary" => program_calculate_summary(state, req),
        "program.distribution" => program_distribution(state, req),
        "program.compare" => program_compare(state, req),
        "program.trends" => program_trends(state, req),
        _ => return None,
    };
    Some(reply(req, result))
}
