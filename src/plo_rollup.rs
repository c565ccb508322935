use crate::batch::{self, BatchOutcome};
use crate::calc::{self, AttainmentStatus};
use crate::db;
use crate::error::{CalcError, CalcResult};
use crate::query::{OrderBy, SelectBuilder, SortColumns};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPloAttainment {
    pub student_id: String,
    pub degree_id: String,
    pub plo_id: String,
    pub plo_code: String,
    pub target_attainment: f64,
    pub total_marks_obtained: f64,
    pub total_possible_marks: f64,
    pub attainment_percentage: f64,
    pub attainment_status: String,
    pub calculated_at: String,
}

/// One student's pass over the PLOs of a degree. PLOs no CLO feeds are
/// reported separately: there is nothing to compute for them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPloRun {
    pub student_id: String,
    pub records: Vec<StudentPloAttainment>,
    pub unmapped_plo_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Plo {
    pub id: String,
    pub code: String,
    pub target_attainment: f64,
}

pub const STUDENT_PLO_SORT_COLUMNS: SortColumns = &[
    ("sortOrder", "p.sort_order"),
    ("ploCode", "p.code"),
    ("percentage", "spa.attainment_percentage"),
    ("status", "spa.attainment_status"),
];

const SELECT_STUDENT_PLO: &str =
    "SELECT spa.student_id, spa.degree_id, spa.plo_id, p.code, p.target_attainment,
            spa.total_marks_obtained, spa.total_possible_marks, spa.attainment_percentage,
            spa.attainment_status, spa.calculated_at
     FROM student_plo_attainment spa
     JOIN plos p ON p.id = spa.plo_id";

fn map_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentPloAttainment> {
    Ok(StudentPloAttainment {
        student_id: r.get(0)?,
        degree_id: r.get(1)?,
        plo_id: r.get(2)?,
        plo_code: r.get(3)?,
        target_attainment: r.get(4)?,
        total_marks_obtained: r.get(5)?,
        total_possible_marks: r.get(6)?,
        attainment_percentage: r.get(7)?,
        attainment_status: r.get(8)?,
        calculated_at: r.get(9)?,
    })
}

pub(crate) fn require_degree(conn: &Connection, degree_id: &str) -> CalcResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM degrees WHERE id = ?", [degree_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !exists {
        return Err(CalcError::not_found(format!("degree {} not found", degree_id)));
    }
    Ok(())
}

/// PLOs of the degree in display order, or just `plo_id` when given.
pub(crate) fn load_plos(
    conn: &Connection,
    degree_id: &str,
    plo_id: Option<&str>,
) -> CalcResult<Vec<Plo>> {
    let mut stmt = conn.prepare(
        "SELECT id, code, target_attainment
         FROM plos
         WHERE degree_id = ?
         ORDER BY sort_order, code, id",
    )?;
    let plos = stmt
        .query_map([degree_id], |r| {
            Ok(Plo {
                id: r.get(0)?,
                code: r.get(1)?,
                target_attainment: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    match plo_id {
        None => Ok(plos),
        Some(id) => {
            let one: Vec<Plo> = plos.into_iter().filter(|p| p.id == id).collect();
            if one.is_empty() {
                return Err(CalcError::not_found(format!(
                    "plo {} not found in degree {}",
                    id, degree_id
                )));
            }
            Ok(one)
        }
    }
}

fn student_degree(conn: &Connection, student_id: &str) -> CalcResult<String> {
    conn.query_row(
        "SELECT degree_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get::<_, String>(0),
    )
    .optional()?
    .ok_or_else(|| CalcError::not_found(format!("student {} not found", student_id)))
}

pub fn get(
    conn: &Connection,
    student_id: &str,
    degree_id: &str,
    plo_id: &str,
) -> CalcResult<Option<StudentPloAttainment>> {
    let sql = format!(
        "{} WHERE spa.student_id = ? AND spa.degree_id = ? AND spa.plo_id = ?",
        SELECT_STUDENT_PLO
    );
    Ok(conn
        .query_row(&sql, (student_id, degree_id, plo_id), map_row)
        .optional()?)
}

fn mapped_clo_count(conn: &Connection, plo_id: &str) -> CalcResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM clo_plo_mappings WHERE plo_id = ?",
        [plo_id],
        |r| r.get(0),
    )?)
}

/// Sums the student's CLO totals over every CLO mapped to each PLO.
pub fn calculate(
    conn: &Connection,
    student_id: &str,
    degree_id: &str,
    plo_id: Option<&str>,
) -> CalcResult<StudentPloRun> {
    require_degree(conn, degree_id)?;
    if student_degree(conn, student_id)? != degree_id {
        return Err(CalcError::not_found(format!(
            "student {} is not in degree {}",
            student_id, degree_id
        )));
    }
    let plos = load_plos(conn, degree_id, plo_id)?;

    let now = db::now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    let mut written: Vec<String> = Vec::new();
    let mut unmapped: Vec<String> = Vec::new();
    for plo in &plos {
        if mapped_clo_count(&tx, &plo.id)? == 0 {
            // An earlier mapping's result no longer applies.
            tx.execute(
                "DELETE FROM student_plo_attainment
                 WHERE student_id = ? AND degree_id = ? AND plo_id = ?",
                (student_id, degree_id, &plo.id),
            )?;
            unmapped.push(plo.id.clone());
            continue;
        }
        let (obtained, possible): (f64, f64) = tx.query_row(
            "SELECT COALESCE(SUM(a.total_marks_obtained), 0), COALESCE(SUM(a.total_possible_marks), 0)
             FROM clo_plo_mappings m
             JOIN student_clo_attainment a ON a.clo_id = m.clo_id AND a.student_id = ?
             WHERE m.plo_id = ?",
            (student_id, &plo.id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let pct = calc::round2(calc::attainment_percentage(obtained, possible));
        let status = AttainmentStatus::from_marks(pct, possible, plo.target_attainment);
        debug!(student_id, plo = %plo.code, pct, status = status.as_str(), "plo attainment computed");
        tx.execute(
            "INSERT INTO student_plo_attainment(
                id, student_id, degree_id, plo_id, total_marks_obtained, total_possible_marks,
                attainment_percentage, attainment_status, calculated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, degree_id, plo_id) DO UPDATE SET
               total_marks_obtained = excluded.total_marks_obtained,
               total_possible_marks = excluded.total_possible_marks,
               attainment_percentage = excluded.attainment_percentage,
               attainment_status = excluded.attainment_status,
               calculated_at = excluded.calculated_at
             WHERE student_plo_attainment.total_marks_obtained IS NOT excluded.total_marks_obtained
                OR student_plo_attainment.total_possible_marks IS NOT excluded.total_possible_marks
                OR student_plo_attainment.attainment_percentage IS NOT excluded.attainment_percentage
                OR student_plo_attainment.attainment_status IS NOT excluded.attainment_status",
            (
                Uuid::new_v4().to_string(),
                student_id,
                degree_id,
                &plo.id,
                obtained,
                possible,
                pct,
                status.as_str(),
                &now,
            ),
        )?;
        written.push(plo.id.clone());
    }
    tx.commit()?;

    let mut records = Vec::with_capacity(written.len());
    for id in &written {
        if let Some(row) = get(conn, student_id, degree_id, id)? {
            records.push(row);
        }
    }
    Ok(StudentPloRun {
        student_id: student_id.to_string(),
        records,
        unmapped_plo_ids: unmapped,
    })
}

pub fn degree_student_ids(conn: &Connection, degree_id: &str) -> CalcResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM students WHERE degree_id = ? ORDER BY last_name, first_name, id",
    )?;
    let ids = stmt
        .query_map([degree_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn calculate_all_students(
    conn: &Connection,
    degree_id: &str,
) -> CalcResult<BatchOutcome<StudentPloRun>> {
    require_degree(conn, degree_id)?;
    let student_ids = degree_student_ids(conn, degree_id)?;
    Ok(batch::run_per_student(
        "plo.calculateAllStudents",
        &student_ids,
        |sid| calculate(conn, sid, degree_id, None),
    ))
}

pub fn list_for_student(
    conn: &Connection,
    student_id: &str,
    degree_id: &str,
    order: OrderBy,
) -> CalcResult<Vec<StudentPloAttainment>> {
    let (sql, binds) = SelectBuilder::new(SELECT_STUDENT_PLO)
        .filter("spa.student_id = ?", student_id.to_string())
        .filter("spa.degree_id = ?", degree_id.to_string())
        .order_by(order)
        .build();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        conn.execute_batch(
            "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');
             INSERT INTO degrees(id, code, name) VALUES('d2', 'BSEE', 'EE');
             INSERT INTO students(id, degree_id, last_name, first_name) VALUES('s1', 'd1', 'Ali', 'Sara');
             INSERT INTO students(id, degree_id, last_name, first_name) VALUES('s9', 'd2', 'Zia', 'Noor');
             INSERT INTO courses(id, code, title, credit_hours) VALUES('c1', 'CS101', 'Programming', 3);
             INSERT INTO clos(id, course_id, code) VALUES('clo1', 'c1', 'CLO1');
             INSERT INTO clos(id, course_id, code) VALUES('clo2', 'c1', 'CLO2');
             INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('p1', 'd1', 'PLO1', 60, 1);
             INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('p2', 'd1', 'PLO2', 50, 2);
             INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('p3', 'd1', 'PLO3', 50, 3);
             INSERT INTO clo_plo_mappings(clo_id, plo_id) VALUES('clo1', 'p1');
             INSERT INTO clo_plo_mappings(clo_id, plo_id) VALUES('clo2', 'p1');
             INSERT INTO clo_plo_mappings(clo_id, plo_id) VALUES('clo2', 'p2');
             INSERT INTO student_clo_attainment(id, student_id, clo_id, total_marks_obtained, total_possible_marks,
                 attainment_percentage, attainment_status, calculated_at)
               VALUES('x1', 's1', 'clo1', 30, 40, 75, 'Achieved', 'then');
             INSERT INTO student_clo_attainment(id, student_id, clo_id, total_marks_obtained, total_possible_marks,
                 attainment_percentage, attainment_status, calculated_at)
               VALUES('x2', 's1', 'clo2', 10, 40, 25, 'Not Achieved', 'then');",
        )
        .expect("seed");
        conn
    }

    #[test]
    fn sums_across_mapped_clos() {
        let conn = setup();
        let run = calculate(&conn, "s1", "d1", None).expect("calc");
        assert_eq!(run.records.len(), 2);
        assert_eq!(run.unmapped_plo_ids, vec!["p3".to_string()]);

        let p1 = &run.records[0];
        assert_eq!(p1.plo_id, "p1");
        assert_eq!(p1.total_marks_obtained, 40.0);
        assert_eq!(p1.total_possible_marks, 80.0);
        assert_eq!(p1.attainment_percentage, 50.0);
        assert_eq!(p1.attainment_status, "Not Achieved");

        let p2 = &run.records[1];
        assert_eq!(p2.attainment_percentage, 25.0);
        assert_eq!(p2.attainment_status, "Not Achieved");
    }

    #[test]
    fn target_is_inclusive() {
        let conn = setup();
        conn.execute("UPDATE plos SET target_attainment = 50 WHERE id = 'p1'", [])
            .expect("target");
        let run = calculate(&conn, "s1", "d1", Some("p1")).expect("calc");
        assert_eq!(run.records[0].attainment_status, "Achieved");
    }

    #[test]
    fn no_clo_rows_is_zero_not_achieved() {
        let conn = setup();
        conn.execute("DELETE FROM student_clo_attainment", []).expect("clear");
        let run = calculate(&conn, "s1", "d1", Some("p1")).expect("calc");
        assert_eq!(run.records[0].total_possible_marks, 0.0);
        assert_eq!(run.records[0].attainment_percentage, 0.0);
        assert_eq!(run.records[0].attainment_status, "Not Achieved");
    }

    #[test]
    fn rejects_foreign_students_and_plos() {
        let conn = setup();
        assert_eq!(calculate(&conn, "s9", "d1", None).unwrap_err().code(), "not_found");
        assert_eq!(
            calculate(&conn, "s1", "d1", Some("nope")).unwrap_err().code(),
            "not_found"
        );
    }

    #[test]
    fn recalculation_is_idempotent() {
        let conn = setup();
        let a = calculate(&conn, "s1", "d1", None).expect("calc");
        let b = calculate(&conn, "s1", "d1", None).expect("recalc");
        assert_eq!(a.records, b.records);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM student_plo_attainment", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 2);
    }

    #[test]
    fn unmapping_a_plo_removes_its_stored_row() {
        let conn = setup();
        calculate(&conn, "s1", "d1", None).expect("calc");
        assert!(get(&conn, "s1", "d1", "p2").expect("get").is_some());

        conn.execute("DELETE FROM clo_plo_mappings WHERE plo_id = 'p2'", [])
            .expect("unmap");
        let run = calculate(&conn, "s1", "d1", None).expect("recalc");
        assert_eq!(run.unmapped_plo_ids, vec!["p2".to_string(), "p3".to_string()]);
        assert_eq!(run.records.len(), 1);
        assert!(get(&conn, "s1", "d1", "p2").expect("get").is_none());
    }

    #[test]
    fn lists_with_allow_listed_order() {
        let conn = setup();
        calculate(&conn, "s1", "d1", None).expect("calc");
        let order = OrderBy::parse(Some("percentage"), Some("desc"), STUDENT_PLO_SORT_COLUMNS, "spa.plo_id")
            .expect("order");
        let rows = list_for_student(&conn, "s1", "d1", order).expect("list");
        let codes: Vec<&str> = rows.iter().map(|r| r.plo_code.as_str()).collect();
        assert_eq!(codes, vec!["PLO1", "PLO2"]);
    }
}
