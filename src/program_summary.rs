//! Program-level PLO aggregation over the per-student rollup.

use crate::calc::{self, BucketShare, OverallStatus};
use crate::db;
use crate::error::{CalcError, CalcResult};
use crate::plo_rollup::{load_plos, require_degree, Plo};
use crate::query::{OrderBy, SelectBuilder, SortColumns};
use crate::settings;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PloSummary {
    pub degree_id: String,
    pub plo_id: String,
    pub plo_code: String,
    pub target_attainment: f64,
    pub total_students: i64,
    pub students_achieved: i64,
    pub students_not_achieved: i64,
    pub average_attainment: f64,
    pub min_attainment: f64,
    pub max_attainment: f64,
    pub std_deviation: f64,
    pub achievement_rate: f64,
    pub overall_status: String,
    pub calculated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub degree_id: String,
    pub plo_id: String,
    pub total_students: usize,
    pub buckets: Vec<BucketShare>,
}

/// One (degree, PLO) row of a cross-program comparison. Summary fields are
/// absent when the PLO has never been summarized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRow {
    pub degree_id: String,
    pub degree_code: String,
    pub plo_id: String,
    pub plo_code: String,
    pub target_attainment: f64,
    pub total_students: Option<i64>,
    pub average_attainment: Option<f64>,
    pub achievement_rate: Option<f64>,
    pub overall_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub plo_id: String,
    pub plo_code: String,
    pub total_students: i64,
    pub students_achieved: i64,
    pub average_attainment: f64,
    pub achievement_rate: f64,
    pub overall_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPeriod {
    pub period: String,
    pub plos: Vec<TrendPoint>,
}

const TREND_SORT_COLUMNS: SortColumns = &[("period", "period")];

const SELECT_SUMMARY: &str =
    "SELECT s.degree_id, s.plo_id, p.code, p.target_attainment, s.total_students,
            s.students_achieved, s.students_not_achieved, s.average_attainment,
            s.min_attainment, s.max_attainment, s.std_deviation, s.achievement_rate,
            s.overall_status, s.calculated_at
     FROM program_plo_summary s
     JOIN plos p ON p.id = s.plo_id";

fn map_summary(r: &rusqlite::Row<'_>) -> rusqlite::Result<PloSummary> {
    Ok(PloSummary {
        degree_id: r.get(0)?,
        plo_id: r.get(1)?,
        plo_code: r.get(2)?,
        target_attainment: r.get(3)?,
        total_students: r.get(4)?,
        students_achieved: r.get(5)?,
        students_not_achieved: r.get(6)?,
        average_attainment: r.get(7)?,
        min_attainment: r.get(8)?,
        max_attainment: r.get(9)?,
        std_deviation: r.get(10)?,
        achievement_rate: r.get(11)?,
        overall_status: r.get(12)?,
        calculated_at: r.get(13)?,
    })
}

pub fn get(conn: &Connection, degree_id: &str, plo_id: &str) -> CalcResult<Option<PloSummary>> {
    let sql = format!("{} WHERE s.degree_id = ? AND s.plo_id = ?", SELECT_SUMMARY);
    Ok(conn
        .query_row(&sql, (degree_id, plo_id), map_summary)
        .optional()?)
}

fn student_rows(conn: &Connection, degree_id: &str, plo_id: &str) -> CalcResult<Vec<(f64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT attainment_percentage, attainment_status
         FROM student_plo_attainment
         WHERE degree_id = ? AND plo_id = ?",
    )?;
    let rows = stmt
        .query_map((degree_id, plo_id), |r| {
            Ok((r.get::<_, f64>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Snapshot period for trend history: the UTC calendar month.
pub fn current_period() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

pub fn calculate_summary(
    conn: &Connection,
    degree_id: &str,
    plo_id: Option<&str>,
) -> CalcResult<Vec<PloSummary>> {
    calculate_summary_for_period(conn, degree_id, plo_id, &current_period())
}

pub(crate) fn calculate_summary_for_period(
    conn: &Connection,
    degree_id: &str,
    plo_id: Option<&str>,
    period: &str,
) -> CalcResult<Vec<PloSummary>> {
    require_degree(conn, degree_id)?;
    let plos = load_plos(conn, degree_id, plo_id)?;
    let ratio = settings::attainment(conn)?.near_target_ratio;

    let now = db::now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    for plo in &plos {
        write_summary(&tx, degree_id, plo, ratio, period, &now)?;
    }
    tx.commit()?;

    let mut out = Vec::with_capacity(plos.len());
    for plo in &plos {
        if let Some(s) = get(conn, degree_id, &plo.id)? {
            out.push(s);
        }
    }
    info!(degree_id, plos = out.len(), period, "program summary calculated");
    Ok(out)
}

fn write_summary(
    conn: &Connection,
    degree_id: &str,
    plo: &Plo,
    near_target_ratio: f64,
    period: &str,
    now: &str,
) -> CalcResult<()> {
    let rows = student_rows(conn, degree_id, &plo.id)?;
    let values: Vec<f64> = rows.iter().map(|(pct, _)| *pct).collect();
    let achieved = rows
        .iter()
        .filter(|(_, status)| status == calc::AttainmentStatus::Achieved.as_str())
        .count();
    let total = rows.len();

    // An empty PLO still gets a row; total_students = 0 tells it apart from
    // a cohort that genuinely averaged zero.
    let stats = calc::describe(&values);
    let (avg, min, max, sd) = match stats {
        Some(d) => (
            calc::round2(d.mean),
            calc::round2(d.min),
            calc::round2(d.max),
            calc::round2(d.std_dev),
        ),
        None => (0.0, 0.0, 0.0, 0.0),
    };
    let rate = calc::round2(calc::rate(achieved, total));
    let status = OverallStatus::classify(avg, plo.target_attainment, near_target_ratio);

    conn.execute(
        "INSERT INTO program_plo_summary(
            id, degree_id, plo_id, total_students, students_achieved, students_not_achieved,
            average_attainment, min_attainment, max_attainment, std_deviation,
            achievement_rate, overall_status, calculated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(degree_id, plo_id) DO UPDATE SET
           total_students = excluded.total_students,
           students_achieved = excluded.students_achieved,
           students_not_achieved = excluded.students_not_achieved,
           average_attainment = excluded.average_attainment,
           min_attainment = excluded.min_attainment,
           max_attainment = excluded.max_attainment,
           std_deviation = excluded.std_deviation,
           achievement_rate = excluded.achievement_rate,
           overall_status = excluded.overall_status,
           calculated_at = excluded.calculated_at
         WHERE program_plo_summary.total_students IS NOT excluded.total_students
            OR program_plo_summary.students_achieved IS NOT excluded.students_achieved
            OR program_plo_summary.average_attainment IS NOT excluded.average_attainment
            OR program_plo_summary.min_attainment IS NOT excluded.min_attainment
            OR program_plo_summary.max_attainment IS NOT excluded.max_attainment
            OR program_plo_summary.std_deviation IS NOT excluded.std_deviation
            OR program_plo_summary.overall_status IS NOT excluded.overall_status",
        (
            Uuid::new_v4().to_string(),
            degree_id,
            &plo.id,
            total as i64,
            achieved as i64,
            (total - achieved) as i64,
            avg,
            min,
            max,
            sd,
            rate,
            status.as_str(),
            now,
        ),
    )?;
    conn.execute(
        "INSERT INTO program_plo_summary_history(
            degree_id, plo_id, period, total_students, students_achieved,
            average_attainment, achievement_rate, overall_status, calculated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(degree_id, plo_id, period) DO UPDATE SET
           total_students = excluded.total_students,
           students_achieved = excluded.students_achieved,
           average_attainment = excluded.average_attainment,
           achievement_rate = excluded.achievement_rate,
           overall_status = excluded.overall_status,
           calculated_at = excluded.calculated_at
         WHERE program_plo_summary_history.total_students IS NOT excluded.total_students
            OR program_plo_summary_history.students_achieved IS NOT excluded.students_achieved
            OR program_plo_summary_history.average_attainment IS NOT excluded.average_attainment
            OR program_plo_summary_history.overall_status IS NOT excluded.overall_status",
        (
            degree_id,
            &plo.id,
            period,
            total as i64,
            achieved as i64,
            avg,
            rate,
            status.as_str(),
            now,
        ),
    )?;
    Ok(())
}

/// Bucket shares are computed against every rollup row for the pair.
pub fn distribution(conn: &Connection, degree_id: &str, plo_id: &str) -> CalcResult<Distribution> {
    require_degree(conn, degree_id)?;
    load_plos(conn, degree_id, Some(plo_id))?;
    let values: Vec<f64> = student_rows(conn, degree_id, plo_id)?
        .into_iter()
        .map(|(pct, _)| pct)
        .collect();
    Ok(Distribution {
        degree_id: degree_id.to_string(),
        plo_id: plo_id.to_string(),
        total_students: values.len(),
        buckets: calc::distribution(&values),
    })
}

pub fn compare(conn: &Connection, degree_ids: &[String]) -> CalcResult<Vec<ComparisonRow>> {
    if degree_ids.is_empty() {
        return Err(CalcError::bad_params("degreeIds must not be empty"));
    }
    let mut stmt = conn.prepare(
        "SELECT d.id, d.code, p.id, p.code, p.target_attainment,
                s.total_students, s.average_attainment, s.achievement_rate, s.overall_status
         FROM degrees d
         JOIN plos p ON p.degree_id = d.id
         LEFT JOIN program_plo_summary s ON s.degree_id = d.id AND s.plo_id = p.id
         WHERE d.id = ?
         ORDER BY p.sort_order, p.code, p.id",
    )?;
    let mut out = Vec::new();
    for degree_id in degree_ids {
        require_degree(conn, degree_id)?;
        let rows = stmt
            .query_map([degree_id], |r| {
                Ok(ComparisonRow {
                    degree_id: r.get(0)?,
                    degree_code: r.get(1)?,
                    plo_id: r.get(2)?,
                    plo_code: r.get(3)?,
                    target_attainment: r.get(4)?,
                    total_students: r.get(5)?,
                    average_attainment: r.get(6)?,
                    achievement_rate: r.get(7)?,
                    overall_status: r.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.extend(rows);
    }
    Ok(out)
}

/// Up to `limit` most recent snapshot periods, newest first.
pub fn trends(
    conn: &Connection,
    degree_id: &str,
    plo_id: Option<&str>,
    limit: i64,
) -> CalcResult<Vec<TrendPeriod>> {
    if limit <= 0 {
        return Err(CalcError::bad_params("limit must be positive"));
    }
    require_degree(conn, degree_id)?;
    if let Some(id) = plo_id {
        load_plos(conn, degree_id, Some(id))?;
    }

    let newest_first = OrderBy::parse(None, Some("desc"), TREND_SORT_COLUMNS, "period")?;
    let mut periods = SelectBuilder::new(
        "SELECT DISTINCT period FROM program_plo_summary_history",
    )
    .filter("degree_id = ?", degree_id.to_string());
    if let Some(id) = plo_id {
        periods = periods.filter("plo_id = ?", id.to_string());
    }
    let (sql, binds) = periods.order_by(newest_first).limit(limit).build();
    let mut stmt = conn.prepare(&sql)?;
    let period_list = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut points = conn.prepare(
        "SELECT h.plo_id, p.code, h.total_students, h.students_achieved,
                h.average_attainment, h.achievement_rate, h.overall_status
         FROM program_plo_summary_history h
         JOIN plos p ON p.id = h.plo_id
         WHERE h.degree_id = ? AND h.period = ? AND (? IS NULL OR h.plo_id = ?)
         ORDER BY p.sort_order, p.code, p.id",
    )?;
    let mut out = Vec::with_capacity(period_list.len());
    for period in period_list {
        let plos = points
            .query_map((degree_id, &period, plo_id, plo_id), |r| {
                Ok(TrendPoint {
                    plo_id: r.get(0)?,
                    plo_code: r.get(1)?,
                    total_students: r.get(2)?,
                    students_achieved: r.get(3)?,
                    average_attainment: r.get(4)?,
                    achievement_rate: r.get(5)?,
                    overall_status: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(TrendPeriod { period, plos });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');
             INSERT INTO degrees(id, code, name) VALUES('d2', 'BSEE', 'EE');
             INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('p1', 'd1', 'PLO1', 60, 1);
             INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('p2', 'd1', 'PLO2', 60, 2);
             INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('q1', 'd2', 'PLO1', 50, 1);",
        )
        .expect("seed");
        for (i, pct) in [80.0, 50.0, 40.0].iter().enumerate() {
            seed_student(&conn, &format!("s{}", i), "d1", "p1", *pct, 60.0);
        }
        conn
    }

    fn seed_student(conn: &Connection, sid: &str, degree: &str, plo: &str, pct: f64, target: f64) {
        conn.execute(
            "INSERT OR IGNORE INTO students(id, degree_id, last_name, first_name) VALUES(?, ?, ?, 'X')",
            (sid, degree, sid),
        )
        .expect("student");
        let status = calc::AttainmentStatus::from_marks(pct, 100.0, target);
        conn.execute(
            "INSERT INTO student_plo_attainment(id, student_id, degree_id, plo_id, total_marks_obtained,
                 total_possible_marks, attainment_percentage, attainment_status, calculated_at)
             VALUES(?, ?, ?, ?, ?, 100, ?, ?, 'then')",
            (format!("{}-{}", sid, plo), sid, degree, plo, pct, pct, status.as_str()),
        )
        .expect("spa");
    }

    #[test]
    fn aggregates_student_rows() {
        let conn = setup();
        let out = calculate_summary_for_period(&conn, "d1", Some("p1"), "2026-01").expect("calc");
        assert_eq!(out.len(), 1);
        let s = &out[0];
        assert_eq!(s.total_students, 3);
        assert_eq!(s.students_achieved, 1);
        assert_eq!(s.students_not_achieved, 2);
        assert_eq!(s.average_attainment, 56.67);
        assert_eq!(s.min_attainment, 40.0);
        assert_eq!(s.max_attainment, 80.0);
        assert_eq!(s.std_deviation, 17.0);
        assert_eq!(s.achievement_rate, 33.33);
        assert_eq!(s.overall_status, "Near Target");
    }

    #[test]
    fn empty_plo_reports_zero_students() {
        let conn = setup();
        let out = calculate_summary_for_period(&conn, "d1", Some("p2"), "2026-01").expect("calc");
        assert_eq!(out[0].total_students, 0);
        assert_eq!(out[0].achievement_rate, 0.0);
        assert_eq!(out[0].overall_status, "Below Target");
    }

    #[test]
    fn near_target_ratio_comes_from_settings() {
        let conn = setup();
        db::settings_set_json(&conn, settings::ATTAINMENT_KEY, &json!({ "nearTargetRatio": 0.95 }))
            .expect("settings");
        let out = calculate_summary_for_period(&conn, "d1", Some("p1"), "2026-01").expect("calc");
        assert_eq!(out[0].overall_status, "Below Target");
    }

    #[test]
    fn recalculation_keeps_one_summary_row() {
        let conn = setup();
        let a = calculate_summary_for_period(&conn, "d1", None, "2026-01").expect("calc");
        let b = calculate_summary_for_period(&conn, "d1", None, "2026-01").expect("recalc");
        assert_eq!(a, b);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM program_plo_summary", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 2);
        let h: i64 = conn
            .query_row("SELECT COUNT(*) FROM program_plo_summary_history", [], |r| r.get(0))
            .expect("count");
        assert_eq!(h, 2);
    }

    #[test]
    fn distribution_buckets_share_the_cohort() {
        let conn = setup();
        let d = distribution(&conn, "d1", "p1").expect("dist");
        assert_eq!(d.total_students, 3);
        let counts: Vec<(&str, usize, f64)> = d
            .buckets
            .iter()
            .map(|b| (b.range, b.count, b.percentage))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("90-100", 0, 0.0),
                ("80-89", 1, 33.33),
                ("70-79", 0, 0.0),
                ("60-69", 0, 0.0),
                ("50-59", 1, 33.33),
                ("<50", 1, 33.33),
            ]
        );
        assert_eq!(distribution(&conn, "d1", "q1").unwrap_err().code(), "not_found");
    }

    #[test]
    fn compare_lists_each_degree_separately() {
        let conn = setup();
        calculate_summary_for_period(&conn, "d1", None, "2026-01").expect("calc");
        let rows = compare(&conn, &["d1".to_string(), "d2".to_string()]).expect("compare");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].degree_id, "d1");
        assert_eq!(rows[0].average_attainment, Some(56.67));
        assert_eq!(rows[2].degree_id, "d2");
        assert_eq!(rows[2].average_attainment, None);
        assert!(compare(&conn, &[]).is_err());
    }

    #[test]
    fn trends_are_newest_first_and_limited() {
        let conn = setup();
        calculate_summary_for_period(&conn, "d1", Some("p1"), "2026-01").expect("jan");
        seed_student(&conn, "s9", "d1", "p1", 90.0, 60.0);
        calculate_summary_for_period(&conn, "d1", Some("p1"), "2026-02").expect("feb");
        calculate_summary_for_period(&conn, "d1", Some("p1"), "2026-03").expect("mar");

        let t = trends(&conn, "d1", Some("p1"), 2).expect("trends");
        let periods: Vec<&str> = t.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(periods, vec!["2026-03", "2026-02"]);
        assert_eq!(t[0].plos[0].total_students, 4);

        let all = trends(&conn, "d1", None, 12).expect("trends");
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].plos[0].total_students, 3);
        assert!(trends(&conn, "d1", None, 0).is_err());
    }
}
