//! Per-student CLO attainment from the components tagged to each CLO.

use crate::calc::{self, AttainmentStatus, ComponentMark};
use crate::course_results::{check_component, offering_credit_hours, require_student};
use crate::db;
use crate::error::CalcResult;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloAttainment {
    pub student_id: String,
    pub clo_id: String,
    pub course_offering_id: String,
    pub total_marks_obtained: f64,
    pub total_possible_marks: f64,
    pub attainment_percentage: f64,
    pub attainment_status: AttainmentStatus,
}

#[derive(Default)]
struct Totals {
    target: f64,
    obtained: f64,
    possible: f64,
}

pub fn calculate(
    conn: &Connection,
    student_id: &str,
    offering_id: &str,
) -> CalcResult<Vec<CloAttainment>> {
    require_student(conn, student_id)?;
    offering_credit_hours(conn, offering_id)?;
    let tx = conn.unchecked_transaction()?;
    let out = calculate_in(&tx, student_id, offering_id)?;
    tx.commit()?;
    Ok(out)
}

/// Same as [`calculate`] but inside the caller's transaction.
///
/// Only graded components count: exempt and missing ones add neither marks
/// nor possible marks, matching the course result.
pub(crate) fn calculate_in(
    conn: &Connection,
    student_id: &str,
    offering_id: &str,
) -> CalcResult<Vec<CloAttainment>> {
    let mut stmt = conn.prepare(
        "SELECT cc.clo_id, c.target_attainment, ac.title, ac.weightage, ac.max_marks,
                sm.marks_obtained, COALESCE(sm.is_absent, 0), COALESCE(sm.is_exempted, 0)
         FROM component_clos cc
         JOIN assessment_components ac ON ac.id = cc.assessment_component_id
         JOIN clos c ON c.id = cc.clo_id
         LEFT JOIN student_marks sm
           ON sm.assessment_component_id = ac.id AND sm.student_id = ?
         WHERE ac.course_offering_id = ?",
    )?;
    let rows = stmt
        .query_map((student_id, offering_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, Option<f64>>(5)?,
                r.get::<_, i64>(6)? != 0,
                r.get::<_, i64>(7)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut per_clo: BTreeMap<String, Totals> = BTreeMap::new();
    for (clo_id, target, title, weightage, max_marks, marks, absent, exempted) in rows {
        let mark = ComponentMark::from_row(marks, absent, exempted);
        check_component(&title, weightage, max_marks, mark)?;
        let entry = per_clo.entry(clo_id).or_default();
        entry.target = target;
        if let ComponentMark::Graded(v) = mark {
            entry.obtained += v;
            entry.possible += max_marks;
        }
    }

    // CLOs of this offering that lost all their component tags.
    let stale: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT clo_id FROM student_clo_attainment
             WHERE student_id = ? AND course_offering_id = ?",
        )?;
        let ids = stmt
            .query_map((student_id, offering_id), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter().filter(|id| !per_clo.contains_key(id)).collect()
    };
    for clo_id in &stale {
        conn.execute(
            "DELETE FROM student_clo_attainment WHERE student_id = ? AND clo_id = ?",
            (student_id, clo_id),
        )?;
    }
    if !stale.is_empty() {
        debug!(student_id, offering_id, removed = stale.len(), "stale clo attainment removed");
    }

    let now = db::now_rfc3339();
    let mut out = Vec::with_capacity(per_clo.len());
    for (clo_id, t) in per_clo {
        let pct = calc::round2(calc::attainment_percentage(t.obtained, t.possible));
        let status = AttainmentStatus::from_marks(pct, t.possible, t.target);
        conn.execute(
            "INSERT INTO student_clo_attainment(
                id, student_id, clo_id, course_offering_id, total_marks_obtained,
                total_possible_marks, attainment_percentage, attainment_status, calculated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, clo_id) DO UPDATE SET
               course_offering_id = excluded.course_offering_id,
               total_marks_obtained = excluded.total_marks_obtained,
               total_possible_marks = excluded.total_possible_marks,
               attainment_percentage = excluded.attainment_percentage,
               attainment_status = excluded.attainment_status,
               calculated_at = excluded.calculated_at
             WHERE student_clo_attainment.course_offering_id IS NOT excluded.course_offering_id
                OR student_clo_attainment.total_marks_obtained IS NOT excluded.total_marks_obtained
                OR student_clo_attainment.total_possible_marks IS NOT excluded.total_possible_marks
                OR student_clo_attainment.attainment_status IS NOT excluded.attainment_status",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &clo_id,
                offering_id,
                t.obtained,
                t.possible,
                pct,
                status.as_str(),
                &now,
            ),
        )?;
        out.push(CloAttainment {
            student_id: student_id.to_string(),
            clo_id,
            course_offering_id: offering_id.to_string(),
            total_marks_obtained: t.obtained,
            total_possible_marks: t.possible,
            attainment_percentage: pct,
            attainment_status: status,
        });
    }
    Ok(out)
}
