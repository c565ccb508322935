use crate::clo_rollup;
use crate::ipc::helpers::{
    calc, db_conn, optional_str, order_by, reply, required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::plo_rollup::{self, STUDENT_PLO_SORT_COLUMNS};
use serde_json::json;

fn clo_calculate(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let offering_id = required_str(req, "courseOfferingId")?;
    let rows = clo_rollup::calculate(conn, &student_id, &offering_id).map_err(calc(req))?;
    Ok(json!({ "attainments": rows }))
}

fn plo_calculate(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let degree_id = required_str(req, "degreeId")?;
    let plo_id = optional_str(req, "ploId")?;
    let run = plo_rollup::calculate(conn, &student_id, &degree_id, plo_id.as_deref())
        .map_err(calc(req))?;
    if plo_id.is_some() {
        // Single PLO: a PLO no CLO feeds is "nothing to compute", not an error.
        let record = run.records.into_iter().next();
        return Ok(json!({ "found": record.is_some(), "record": record }));
    }
    Ok(json!(run))
}

fn plo_calculate_all_students(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let degree_id = required_str(req, "degreeId")?;
    let outcome = plo_rollup::calculate_all_students(conn, &degree_id).map_err(calc(req))?;
    Ok(outcome.to_json())
}

fn plo_student_list(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let degree_id = required_str(req, "degreeId")?;
    let order = order_by(req, STUDENT_PLO_SORT_COLUMNS, "spa.plo_id")?;
    let rows = plo_rollup::list_for_student(conn, &student_id, &degree_id, order)
        .map_err(calc(req))?;
    Ok(json!({ "records": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "clo.calculate" => clo_calculate(state, req),
        "plo.calculate" => plo_calculate(state, req),
        "plo.calculateAllStudents" => plo_calculate_all_students(state, req),
        "plo.student.list" => plo_student_list(state, req),
        _ => return None,
    };
    Some(reply(req, result))
}
