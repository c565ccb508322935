use crate::course_results::{self, RESULT_SORT_COLUMNS};
use crate::ipc::helpers::{
    calc, db_conn, optional_bool, optional_str, order_by, reply, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

/// Explicit `gradeScaleId`, else the workspace's single active scale.
fn grade_scale(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    match optional_str(req, "gradeScaleId")? {
        Some(id) => Ok(id),
        None => course_results::active_grade_scale_id(conn).map_err(calc(req)),
    }
}

fn results_calculate(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let offering_id = required_str(req, "courseOfferingId")?;
    let scale = grade_scale(conn, req)?;
    let result =
        course_results::calculate(conn, &student_id, &offering_id, &scale).map_err(calc(req))?;
    Ok(json!({ "result": result, "gradeScaleId": scale }))
}

fn results_calculate_all(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let offering_id = required_str(req, "courseOfferingId")?;
    let scale = grade_scale(conn, req)?;
    let outcome =
        course_results::calculate_all(conn, &offering_id, &scale).map_err(calc(req))?;
    let mut body = outcome.to_json();
    body["gradeScaleId"] = json!(scale);
    Ok(body)
}

fn results_publish(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let offering_id = required_str(req, "courseOfferingId")?;
    let publish = optional_bool(req, "publish", true)?;
    let updated = course_results::publish(conn, &offering_id, publish).map_err(calc(req))?;
    Ok(json!({ "updated": updated, "isPublished": publish }))
}

fn results_list(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let offering_id = required_str(req, "courseOfferingId")?;
    let order = order_by(req, RESULT_SORT_COLUMNS, "cr.student_id")?;
    let published_only = optional_bool(req, "publishedOnly", false)?;
    let rows =
        course_results::list(conn, &offering_id, order, published_only).map_err(calc(req))?;
    Ok(json!({ "results": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "results.calculate" => results_calculate(state, req),
        "results.calculateAll" => results_calculate_all(state, req),
        "results.publish" => results_publish(state, req),
        "results.list" => results_list(state, req),
        _ => return None,
    };
    Some(reply(req, result))
}
