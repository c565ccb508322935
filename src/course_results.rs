use crate::batch::{self, BatchOutcome};
use crate::calc::{self, ComponentMark, ComponentScore, PercentBand, ResultStatus};
use crate::clo_rollup;
use crate::db;
use crate::error::{CalcError, CalcResult};
use crate::query::{OrderBy, SelectBuilder, SortColumns};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResult {
    pub student_id: String,
    pub course_offering_id: String,
    pub total_marks: f64,
    pub percentage: f64,
    pub letter_grade: Option<String>,
    pub grade_point: Option<f64>,
    pub credit_earned: f64,
    pub status: String,
    pub is_published: bool,
    pub calculated_at: String,
}

#[derive(Debug, Clone)]
pub struct GradeBand {
    pub letter_grade: String,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub grade_point: f64,
}

impl PercentBand for GradeBand {
    fn min_percentage(&self) -> f64 {
        self.min_percentage
    }
    fn max_percentage(&self) -> f64 {
        self.max_percentage
    }
}

pub const RESULT_SORT_COLUMNS: SortColumns = &[
    ("studentId", "cr.student_id"),
    ("percentage", "cr.percentage"),
    ("status", "cr.status"),
    ("letterGrade", "cr.letter_grade"),
    ("calculatedAt", "cr.calculated_at"),
];

/// The single grade scale flagged active. Only the API boundary calls this;
/// the calculation itself takes the scale explicitly.
pub fn active_grade_scale_id(conn: &Connection) -> CalcResult<String> {
    let mut stmt = conn.prepare("SELECT id FROM grade_scales WHERE is_active = 1 ORDER BY id")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    match ids.as_slice() {
        [] => Err(CalcError::Config("no active grade scale".into())),
        [id] => Ok(id.clone()),
        _ => Err(CalcError::Config(format!(
            "{} grade scales are active; exactly one is expected",
            ids.len()
        ))),
    }
}

pub fn load_grade_bands(conn: &Connection, grade_scale_id: &str) -> CalcResult<Vec<GradeBand>> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM grade_scales WHERE id = ?",
            [grade_scale_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(CalcError::not_found("grade scale not found"));
    }
    let mut stmt = conn.prepare(
        "SELECT letter_grade, min_percentage, max_percentage, grade_point
         FROM grade_points
         WHERE grade_scale_id = ?
         ORDER BY min_percentage",
    )?;
    let bands = stmt
        .query_map([grade_scale_id], |r| {
            Ok(GradeBand {
                letter_grade: r.get(0)?,
                min_percentage: r.get(1)?,
                max_percentage: r.get(2)?,
                grade_point: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bands)
}

pub(crate) fn require_student(conn: &Connection, student_id: &str) -> CalcResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !exists {
        return Err(CalcError::not_found(format!("student {} not found", student_id)));
    }
    Ok(())
}

/// Credit hours of the course behind an offering.
pub(crate) fn offering_credit_hours(conn: &Connection, offering_id: &str) -> CalcResult<f64> {
    conn.query_row(
        "SELECT c.credit_hours
         FROM course_offerings o
         JOIN courses c ON c.id = o.course_id
         WHERE o.id = ?",
        [offering_id],
        |r| r.get::<_, f64>(0),
    )
    .optional()?
    .ok_or_else(|| CalcError::not_found("course offering not found"))
}

/// Rejects component rows that would push a percentage outside 0..=100.
pub(crate) fn check_component(
    title: &str,
    weightage: f64,
    max_marks: f64,
    mark: ComponentMark,
) -> CalcResult<()> {
    if !weightage.is_finite() || !(0.0..=100.0).contains(&weightage) {
        return Err(CalcError::bad_params(format!(
            "component '{}': weightage {} outside 0..=100",
            title, weightage
        )));
    }
    if !max_marks.is_finite() || max_marks <= 0.0 {
        return Err(CalcError::bad_params(format!(
            "component '{}' has non-positive max_marks",
            title
        )));
    }
    if let ComponentMark::Graded(v) = mark {
        if !(0.0..=max_marks).contains(&v) {
            return Err(CalcError::bad_params(format!(
                "component '{}': marks {} outside 0..={}",
                title, v, max_marks
            )));
        }
    }
    Ok(())
}

fn load_component_scores(
    conn: &Connection,
    student_id: &str,
    offering_id: &str,
) -> CalcResult<Vec<ComponentScore>> {
    let mut stmt = conn.prepare(
        "SELECT ac.title, ac.weightage, ac.max_marks,
                sm.marks_obtained, COALESCE(sm.is_absent, 0), COALESCE(sm.is_exempted, 0)
         FROM assessment_components ac
         LEFT JOIN student_marks sm
           ON sm.assessment_component_id = ac.id AND sm.student_id = ?
         WHERE ac.course_offering_id = ?
         ORDER BY COALESCE(ac.sequence_number, 0), ac.id",
    )?;
    let rows = stmt
        .query_map((student_id, offering_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, i64>(4)? != 0,
                r.get::<_, i64>(5)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (title, weightage, max_marks, marks, absent, exempted) in rows {
        let mark = ComponentMark::from_row(marks, absent, exempted);
        check_component(&title, weightage, max_marks, mark)?;
        out.push(ComponentScore {
            weightage,
            max_marks,
            mark,
        });
    }
    Ok(out)
}

fn map_result(r: &rusqlite::Row<'_>) -> rusqlite::Result<CourseResult> {
    Ok(CourseResult {
        student_id: r.get(0)?,
        course_offering_id: r.get(1)?,
        total_marks: r.get(2)?,
        percentage: r.get(3)?,
        letter_grade: r.get(4)?,
        grade_point: r.get(5)?,
        credit_earned: r.get(6)?,
        status: r.get(7)?,
        is_published: r.get::<_, i64>(8)? != 0,
        calculated_at: r.get(9)?,
    })
}

const SELECT_RESULT: &str =
    "SELECT cr.student_id, cr.course_offering_id, cr.total_marks, cr.percentage, cr.letter_grade,
            cr.grade_point, cr.credit_earned, cr.status, cr.is_published, cr.calculated_at
     FROM course_results cr";

pub fn get(
    conn: &Connection,
    student_id: &str,
    offering_id: &str,
) -> CalcResult<Option<CourseResult>> {
    let sql = format!(
        "{} WHERE cr.student_id = ? AND cr.course_offering_id = ?",
        SELECT_RESULT
    );
    Ok(conn
        .query_row(&sql, (student_id, offering_id), map_result)
        .optional()?)
}

/// Recomputes one student's result for an offering against `grade_scale_id`
/// and refreshes the student's CLO attainment for the same offering.
pub fn calculate(
    conn: &Connection,
    student_id: &str,
    offering_id: &str,
    grade_scale_id: &str,
) -> CalcResult<CourseResult> {
    require_student(conn, student_id)?;
    let credit_hours = offering_credit_hours(conn, offering_id)?;
    let bands = load_grade_bands(conn, grade_scale_id)?;
    let components = load_component_scores(conn, student_id, offering_id)?;

    let wp = calc::weighted_percentage(components);
    // Grade on the exact value; only the stored copy is rounded.
    let band = calc::resolve_band(&bands, wp.percentage);
    let percentage = calc::round2(wp.percentage);
    let grade_point = band.map(|b| b.grade_point);
    let status = ResultStatus::decide(grade_point, wp.has_incomplete());
    let credit = calc::credit_earned(grade_point, credit_hours);

    debug!(
        student_id,
        offering_id,
        percentage,
        graded = wp.graded_count,
        missing = wp.missing_count,
        exempted = wp.exempted_count,
        status = status.as_str(),
        "course result computed"
    );

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO course_results(
            id, student_id, course_offering_id, total_marks, percentage, letter_grade,
            grade_point, credit_earned, status, calculated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_offering_id) DO UPDATE SET
           total_marks = excluded.total_marks,
           percentage = excluded.percentage,
           letter_grade = excluded.letter_grade,
           grade_point = excluded.grade_point,
           credit_earned = excluded.credit_earned,
           status = excluded.status,
           calculated_at = excluded.calculated_at
         WHERE course_results.total_marks IS NOT excluded.total_marks
            OR course_results.percentage IS NOT excluded.percentage
            OR course_results.letter_grade IS NOT excluded.letter_grade
            OR course_results.grade_point IS NOT excluded.grade_point
            OR course_results.credit_earned IS NOT excluded.credit_earned
            OR course_results.status IS NOT excluded.status",
        (
            Uuid::new_v4().to_string(),
            student_id,
            offering_id,
            calc::round2(wp.weighted_marks),
            percentage,
            band.map(|b| b.letter_grade.clone()),
            grade_point,
            credit,
            status.as_str(),
            db::now_rfc3339(),
        ),
    )?;
    clo_rollup::calculate_in(&tx, student_id, offering_id)?;
    tx.commit()?;

    get(conn, student_id, offering_id)?
        .ok_or_else(|| CalcError::not_found("course result not found after write"))
}

pub fn active_student_ids(conn: &Connection, offering_id: &str) -> CalcResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT e.student_id
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.course_offering_id = ? AND e.status = 'active' AND s.active = 1
         ORDER BY s.last_name, s.first_name, s.id",
    )?;
    let ids = stmt
        .query_map([offering_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn calculate_all(
    conn: &Connection,
    offering_id: &str,
    grade_scale_id: &str,
) -> CalcResult<BatchOutcome<CourseResult>> {
    offering_credit_hours(conn, offering_id)?;
    load_grade_bands(conn, grade_scale_id)?;
    let student_ids = active_student_ids(conn, offering_id)?;
    Ok(batch::run_per_student(
        "results.calculateAll",
        &student_ids,
        |sid| calculate(conn, sid, offering_id, grade_scale_id),
    ))
}

/// Flips visibility for every result of the offering; returns rows touched.
pub fn publish(conn: &Connection, offering_id: &str, publish: bool) -> CalcResult<usize> {
    offering_credit_hours(conn, offering_id)?;
    let n = conn.execute(
        "UPDATE course_results SET is_published = ? WHERE course_offering_id = ?",
        (publish as i64, offering_id),
    )?;
    Ok(n)
}

pub fn list(
    conn: &Connection,
    offering_id: &str,
    order: OrderBy,
    published_only: bool,
) -> CalcResult<Vec<CourseResult>> {
    let mut builder =
        SelectBuilder::new(SELECT_RESULT).filter("cr.course_offering_id = ?", offering_id.to_string());
    if published_only {
        builder = builder.condition("cr.is_published = 1");
    }
    let (sql, binds) = builder.order_by(order).build();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), map_result)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
