use crate::error::{CalcError, CalcResult};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "attaind.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Source tables. The pipeline only reads these; they are populated by the
    // surrounding academic records system.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS degrees(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            degree_id TEXT NOT NULL,
            student_no TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_degree ON students(degree_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            credit_hours REAL NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_offerings(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            term TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            course_offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            PRIMARY KEY(course_offering_id, student_id),
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_components(
            id TEXT PRIMARY KEY,
            course_offering_id TEXT NOT NULL,
            title TEXT NOT NULL,
            weightage REAL NOT NULL,
            max_marks REAL NOT NULL,
            sequence_number INTEGER,
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_components_offering ON assessment_components(course_offering_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_marks(
            student_id TEXT NOT NULL,
            assessment_component_id TEXT NOT NULL,
            marks_obtained REAL,
            is_absent INTEGER NOT NULL DEFAULT 0,
            is_exempted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(student_id, assessment_component_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(assessment_component_id) REFERENCES assessment_components(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_points(
            id TEXT PRIMARY KEY,
            grade_scale_id TEXT NOT NULL,
            letter_grade TEXT NOT NULL,
            min_percentage REAL NOT NULL,
            max_percentage REAL NOT NULL,
            grade_point REAL NOT NULL,
            FOREIGN KEY(grade_scale_id) REFERENCES grade_scales(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS clos(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            target_attainment REAL NOT NULL DEFAULT 60,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS plos(
            id TEXT PRIMARY KEY,
            degree_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            target_attainment REAL NOT NULL DEFAULT 60,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plos_degree ON plos(degree_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS peos(
            id TEXT PRIMARY KEY,
            degree_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            target_attainment REAL NOT NULL DEFAULT 60,
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_clos(
            assessment_component_id TEXT NOT NULL,
            clo_id TEXT NOT NULL,
            PRIMARY KEY(assessment_component_id, clo_id),
            FOREIGN KEY(assessment_component_id) REFERENCES assessment_components(id),
            FOREIGN KEY(clo_id) REFERENCES clos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS clo_plo_mappings(
            clo_id TEXT NOT NULL,
            plo_id TEXT NOT NULL,
            PRIMARY KEY(clo_id, plo_id),
            FOREIGN KEY(clo_id) REFERENCES clos(id),
            FOREIGN KEY(plo_id) REFERENCES plos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clo_plo_mappings_plo ON clo_plo_mappings(plo_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS surveys(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            degree_id TEXT,
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS survey_questions(
            id TEXT PRIMARY KEY,
            survey_id TEXT NOT NULL,
            question_text TEXT NOT NULL,
            question_type TEXT NOT NULL,
            options_json TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(survey_id) REFERENCES surveys(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS survey_responses(
            id TEXT PRIMARY KEY,
            survey_id TEXT NOT NULL,
            respondent_id TEXT,
            submitted_at TEXT,
            FOREIGN KEY(survey_id) REFERENCES surveys(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS survey_answers(
            response_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            answer_value TEXT,
            PRIMARY KEY(response_id, question_id),
            FOREIGN KEY(response_id) REFERENCES survey_responses(id),
            FOREIGN KEY(question_id) REFERENCES survey_questions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS survey_outcome_mappings(
            question_id TEXT NOT NULL,
            outcome_type TEXT NOT NULL CHECK(outcome_type IN ('CLO', 'PLO')),
            outcome_id TEXT NOT NULL,
            PRIMARY KEY(question_id, outcome_type, outcome_id),
            FOREIGN KEY(question_id) REFERENCES survey_questions(id)
        )",
        [],
    )?;

    // Configuration written by this service.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attainment_thresholds(
            id TEXT PRIMARY KEY,
            degree_id TEXT NOT NULL,
            outcome_type TEXT NOT NULL CHECK(outcome_type IN ('CLO', 'PLO', 'PEO')),
            level_name TEXT NOT NULL,
            min_percentage REAL NOT NULL,
            max_percentage REAL NOT NULL,
            is_attained INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_thresholds_degree_type ON attainment_thresholds(degree_id, outcome_type)",
        [],
    )?;

    // Derived tables. Every one is unique on its natural key; the pipeline
    // writes them with INSERT .. ON CONFLICT.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_offering_id TEXT NOT NULL,
            total_marks REAL NOT NULL,
            percentage REAL NOT NULL,
            letter_grade TEXT,
            grade_point REAL,
            credit_earned REAL NOT NULL,
            status TEXT NOT NULL,
            is_published INTEGER NOT NULL DEFAULT 0,
            calculated_at TEXT NOT NULL,
            UNIQUE(student_id, course_offering_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_results_offering ON course_results(course_offering_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_clo_attainment(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            clo_id TEXT NOT NULL,
            course_offering_id TEXT,
            total_marks_obtained REAL NOT NULL,
            total_possible_marks REAL NOT NULL,
            attainment_percentage REAL NOT NULL,
            attainment_status TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            UNIQUE(student_id, clo_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(clo_id) REFERENCES clos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_plo_attainment(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            degree_id TEXT NOT NULL,
            plo_id TEXT NOT NULL,
            total_marks_obtained REAL NOT NULL,
            total_possible_marks REAL NOT NULL,
            attainment_percentage REAL NOT NULL,
            attainment_status TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            UNIQUE(student_id, degree_id, plo_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(degree_id) REFERENCES degrees(id),
            FOREIGN KEY(plo_id) REFERENCES plos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_plo_degree_plo ON student_plo_attainment(degree_id, plo_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS program_plo_summary(
            id TEXT PRIMARY KEY,
            degree_id TEXT NOT NULL,
            plo_id TEXT NOT NULL,
            total_students INTEGER NOT NULL,
            students_achieved INTEGER NOT NULL,
            students_not_achieved INTEGER NOT NULL,
            average_attainment REAL NOT NULL,
            min_attainment REAL NOT NULL,
            max_attainment REAL NOT NULL,
            std_deviation REAL NOT NULL,
            achievement_rate REAL NOT NULL,
            overall_status TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            UNIQUE(degree_id, plo_id),
            FOREIGN KEY(degree_id) REFERENCES degrees(id),
            FOREIGN KEY(plo_id) REFERENCES plos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS program_plo_summary_history(
            degree_id TEXT NOT NULL,
            plo_id TEXT NOT NULL,
            period TEXT NOT NULL,
            total_students INTEGER NOT NULL,
            students_achieved INTEGER NOT NULL,
            average_attainment REAL NOT NULL,
            achievement_rate REAL NOT NULL,
            overall_status TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            PRIMARY KEY(degree_id, plo_id, period),
            FOREIGN KEY(degree_id) REFERENCES degrees(id),
            FOREIGN KEY(plo_id) REFERENCES plos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS indirect_attainment_results(
            id TEXT PRIMARY KEY,
            survey_id TEXT NOT NULL,
            outcome_type TEXT NOT NULL,
            outcome_id TEXT NOT NULL,
            total_responses INTEGER NOT NULL,
            attainment_percentage REAL NOT NULL,
            attainment_status TEXT NOT NULL,
            question_summaries_json TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            UNIQUE(survey_id, outcome_type, outcome_id),
            FOREIGN KEY(survey_id) REFERENCES surveys(id)
        )",
        [],
    )?;

    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Stored JSON under `key`. Undecodable JSON is a configuration error;
/// database failures pass through unchanged.
pub fn settings_get_json(conn: &Connection, key: &str) -> CalcResult<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| CalcError::Config(format!("{}: {}", key, e)))
    })
    .transpose()
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
