#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub struct Sidecar {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn spawn_sidecar() -> Sidecar {
    let exe = env!("CARGO_BIN_EXE_attaind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attaind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    Sidecar {
        child,
        stdin,
        reader: BufReader::new(stdout),
    }
}

pub fn request(sc: &mut Sidecar, id: &str, method: &str, params: serde_json::Value) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(sc.stdin, "{}", payload).expect("write request");
    sc.stdin.flush().expect("flush request");

    let mut line = String::new();
    sc.reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(sc: &mut Sidecar, id: &str, method: &str, params: serde_json::Value) -> serde_json::Value {
    let value = request(sc, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the error code of a call that must fail.
pub fn request_err(sc: &mut Sidecar, id: &str, method: &str, params: serde_json::Value) -> String {
    let value = request(sc, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Spawns the sidecar on a fresh workspace; the schema exists once this returns.
pub fn open_workspace() -> (tempfile::TempDir, Sidecar) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sc = spawn_sidecar();
    request_ok(
        &mut sc,
        "open",
        "workspace.select",
        json!({ "path": dir.path().to_string_lossy() }),
    );
    (dir, sc)
}

pub fn db(workspace: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(workspace.join("attaind.sqlite3")).expect("open workspace db")
}

pub fn seed(workspace: &Path, sql: &str) {
    db(workspace).execute_batch(sql).expect("seed workspace");
}

/// One degree with a 3-credit course offering: components Midterm (60%, out of
/// 100) and Final (40%, out of 50), each tagged to its own CLO, both CLOs
/// feeding PLO1 (target 60). One active grade scale.
pub const COURSE_FIXTURE: &str = "
    INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'Computer Science');
    INSERT INTO students(id, degree_id, last_name, first_name) VALUES('s1', 'd1', 'Ahmed', 'Ayesha');
    INSERT INTO students(id, degree_id, last_name, first_name) VALUES('s2', 'd1', 'Baig', 'Omar');
    INSERT INTO students(id, degree_id, last_name, first_name) VALUES('s3', 'd1', 'Chaudhry', 'Hina');
    INSERT INTO courses(id, code, title, credit_hours) VALUES('c1', 'CS101', 'Programming', 3);
    INSERT INTO course_offerings(id, course_id, term) VALUES('o1', 'c1', 'Fall');
    INSERT INTO enrollments(course_offering_id, student_id) VALUES('o1', 's1');
    INSERT INTO enrollments(course_offering_id, student_id) VALUES('o1', 's2');
    INSERT INTO enrollments(course_offering_id, student_id) VALUES('o1', 's3');
    INSERT INTO assessment_components(id, course_offering_id, title, weightage, max_marks, sequence_number)
      VALUES('a1', 'o1', 'Midterm', 60, 100, 1);
    INSERT INTO assessment_components(id, course_offering_id, title, weightage, max_marks, sequence_number)
      VALUES('a2', 'o1', 'Final', 40, 50, 2);
    INSERT INTO clos(id, course_id, code, target_attainment) VALUES('clo1', 'c1', 'CLO1', 60);
    INSERT INTO clos(id, course_id, code, target_attainment) VALUES('clo2', 'c1', 'CLO2', 60);
    INSERT INTO component_clos(assessment_component_id, clo_id) VALUES('a1', 'clo1');
    INSERT INTO component_clos(assessment_component_id, clo_id) VALUES('a2', 'clo2');
    INSERT INTO plos(id, degree_id, code, target_attainment, sort_order) VALUES('p1', 'd1', 'PLO1', 60, 1);
    INSERT INTO clo_plo_mappings(clo_id, plo_id) VALUES('clo1', 'p1');
    INSERT INTO clo_plo_mappings(clo_id, plo_id) VALUES('clo2', 'p1');
    INSERT INTO grade_scales(id, name, is_active) VALUES('g1', 'Standard', 1);
    INSERT INTO grade_points(id, grade_scale_id, letter_grade, min_percentage, max_percentage, grade_point)
      VALUES('gA', 'g1', 'A', 75, 100, 4.0);
    INSERT INTO grade_points(id, grade_scale_id, letter_grade, min_percentage, max_percentage, grade_point)
      VALUES('gC', 'g1', 'C', 50, 74, 2.0);
    INSERT INTO grade_points(id, grade_scale_id, letter_grade, min_percentage, max_percentage, grade_point)
      VALUES('gF', 'g1', 'F', 0, 49, 0.0);
";

pub fn mark(workspace: &Path, student: &str, component: &str, marks: Option<f64>, absent: bool) {
    db(workspace)
        .execute(
            "INSERT INTO student_marks(student_id, assessment_component_id, marks_obtained, is_absent)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(student_id, assessment_component_id) DO UPDATE SET
               marks_obtained = excluded.marks_obtained,
               is_absent = excluded.is_absent",
            (student, component, marks, absent as i64),
        )
        .expect("mark");
}
