use crate::indirect::{self, INDIRECT_SORT_COLUMNS};
use crate::ipc::helpers::{
    calc, db_conn, optional_bool, optional_outcome_type, optional_str, order_by, outcome_type,
    reply, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn indirect_calculate(state: &AppState, req: &Request, always_persist: bool) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let survey_id = required_str(req, "surveyId")?;
    let outcome_type = outcome_type(req, "outcomeType")?;
    let outcome_id = optional_str(req, "outcomeId")?;
    let persist = always_persist || optional_bool(req, "persist", false)?;
    let run = indirect::calculate_from_survey(
        conn,
        &survey_id,
        outcome_type,
        outcome_id.as_deref(),
        persist,
    )
    .map_err(calc(req))?;
    if outcome_id.is_some() {
        let persisted = run.persisted;
        let record = run.results.into_iter().next();
        return Ok(json!({
            "found": record.is_some(),
            "record": record,
            "persisted": persisted,
        }));
    }
    Ok(json!(run))
}

fn indirect_results_list(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let survey_id = required_str(req, "surveyId")?;
    let outcome_type = optional_outcome_type(req, "outcomeType")?;
    let order = order_by(req, INDIRECT_SORT_COLUMNS, "r.outcome_id")?;
    let rows =
        indirect::list_results(conn, &survey_id, outcome_type, order).map_err(calc(req))?;
    Ok(json!({ "results": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "indirect.calculate" => indirect_calculate(state, req, false),
        "indirect.recalculate" => indirect_calculate(state, req, true),
        "indirect.results.list" => indirect_results_list(state, req),
        _ => return None,
    };
    Some(reply(req, result))
}
