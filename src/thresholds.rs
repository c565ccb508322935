use crate::calc::{self, PercentBand};
use crate::db;
use crate::error::{CalcError, CalcResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeType {
    #[serde(rename = "CLO")]
    Clo,
    #[serde(rename = "PLO")]
    Plo,
    #[serde(rename = "PEO")]
    Peo,
}

impl OutcomeType {
    pub fn parse(raw: &str) -> CalcResult<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CLO" => Ok(OutcomeType::Clo),
            "PLO" => Ok(OutcomeType::Plo),
            "PEO" => Ok(OutcomeType::Peo),
            _ => Err(CalcError::bad_params(format!(
                "outcomeType must be one of: CLO, PLO, PEO (got {})",
                raw
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeType::Clo => "CLO",
            OutcomeType::Plo => "PLO",
            OutcomeType::Peo => "PEO",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Threshold {
    pub id: String,
    pub degree_id: String,
    pub outcome_type: String,
    pub level_name: String,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub is_attained: bool,
    pub updated_at: String,
}

impl PercentBand for Threshold {
    fn min_percentage(&self) -> f64 {
        self.min_percentage
    }
    fn max_percentage(&self) -> f64 {
        self.max_percentage
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdInput {
    pub degree_id: String,
    pub outcome_type: OutcomeType,
    pub level_name: String,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub is_attained: bool,
}

pub fn validate_percentage(value: f64, key: &str) -> CalcResult<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(CalcError::bad_params(format!(
            "{} must be within 0..=100",
            key
        )));
    }
    Ok(())
}

fn validate_input(input: &ThresholdInput) -> CalcResult<()> {
    if input.degree_id.trim().is_empty() {
        return Err(CalcError::bad_params("missing degreeId"));
    }
    if input.level_name.trim().is_empty() {
        return Err(CalcError::bad_params("levelName must not be empty"));
    }
    validate_percentage(input.min_percentage, "minPercentage")?;
    validate_percentage(input.max_percentage, "maxPercentage")?;
    if input.min_percentage > input.max_percentage {
        return Err(CalcError::bad_params(
            "minPercentage must not exceed maxPercentage",
        ));
    }
    Ok(())
}

const SELECT_THRESHOLD: &str =
    "SELECT id, degree_id, outcome_type, level_name, min_percentage, max_percentage, is_attained, updated_at
     FROM attainment_thresholds";

fn map_threshold(r: &rusqlite::Row<'_>) -> rusqlite::Result<Threshold> {
    Ok(Threshold {
        id: r.get(0)?,
        degree_id: r.get(1)?,
        outcome_type: r.get(2)?,
        level_name: r.get(3)?,
        min_percentage: r.get(4)?,
        max_percentage: r.get(5)?,
        is_attained: r.get::<_, i64>(6)? != 0,
        updated_at: r.get(7)?,
    })
}

pub fn list(
    conn: &Connection,
    degree_id: &str,
    outcome_type: Option<OutcomeType>,
) -> CalcResult<Vec<Threshold>> {
    let rows = match outcome_type {
        Some(t) => {
            let sql = format!(
                "{} WHERE degree_id = ? AND outcome_type = ? ORDER BY min_percentage",
                SELECT_THRESHOLD
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((degree_id, t.as_str()), map_threshold)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "{} WHERE degree_id = ? ORDER BY outcome_type, min_percentage",
                SELECT_THRESHOLD
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([degree_id], map_threshold)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn get(conn: &Connection, id: &str) -> CalcResult<Option<Threshold>> {
    let sql = format!("{} WHERE id = ?", SELECT_THRESHOLD);
    Ok(conn.query_row(&sql, [id], map_threshold).optional()?)
}

/// The band `percentage` falls into for (degree, outcome type), if any.
/// No band is a normal answer, not an error.
pub fn evaluate(
    conn: &Connection,
    degree_id: &str,
    outcome_type: OutcomeType,
    percentage: f64,
) -> CalcResult<Option<Threshold>> {
    validate_percentage(percentage, "percentage")?;
    let bands = list(conn, degree_id, Some(outcome_type))?;
    Ok(calc::resolve_band(&bands, percentage).cloned())
}

/// First existing band of (degree, outcome type) that intersects `[min, max]`,
/// ignoring `exclude_id`.
pub fn find_overlap(
    conn: &Connection,
    degree_id: &str,
    outcome_type: OutcomeType,
    min: f64,
    max: f64,
    exclude_id: Option<&str>,
) -> CalcResult<Option<Threshold>> {
    let existing = list(conn, degree_id, Some(outcome_type))?;
    Ok(existing.into_iter().find(|t| {
        Some(t.id.as_str()) != exclude_id
            && calc::ranges_overlap(min, max, t.min_percentage, t.max_percentage)
    }))
}

pub fn validate_no_overlap(
    conn: &Connection,
    degree_id: &str,
    outcome_type: OutcomeType,
    min: f64,
    max: f64,
    exclude_id: Option<&str>,
) -> CalcResult<bool> {
    validate_percentage(min, "minPercentage")?;
    validate_percentage(max, "maxPercentage")?;
    if min > max {
        return Err(CalcError::bad_params(
            "minPercentage must not exceed maxPercentage",
        ));
    }
    Ok(find_overlap(conn, degree_id, outcome_type, min, max, exclude_id)?.is_none())
}

fn degree_exists(conn: &Connection, degree_id: &str) -> CalcResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM degrees WHERE id = ?", [degree_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn reject_overlap(
    conn: &Connection,
    input: &ThresholdInput,
    exclude_id: Option<&str>,
) -> CalcResult<()> {
    if let Some(existing) = find_overlap(
        conn,
        &input.degree_id,
        input.outcome_type,
        input.min_percentage,
        input.max_percentage,
        exclude_id,
    )? {
        warn!(
            degree_id = %input.degree_id,
            outcome_type = input.outcome_type.as_str(),
            existing_id = %existing.id,
            "threshold range overlaps an existing band"
        );
        return Err(CalcError::conflict(
            format!(
                "range {}..={} overlaps existing band '{}' ({}..={})",
                input.min_percentage,
                input.max_percentage,
                existing.level_name,
                existing.min_percentage,
                existing.max_percentage
            ),
            json!({ "existing": existing }),
        ));
    }
    Ok(())
}

pub fn create(conn: &Connection, input: &ThresholdInput) -> CalcResult<Threshold> {
    validate_input(input)?;
    if !degree_exists(conn, &input.degree_id)? {
        return Err(CalcError::not_found("degree not found"));
    }
    let tx = conn.unchecked_transaction()?;
    reject_overlap(&tx, input, None)?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO attainment_thresholds(
            id, degree_id, outcome_type, level_name, min_percentage, max_percentage, is_attained, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.degree_id,
            input.outcome_type.as_str(),
            input.level_name.trim(),
            input.min_percentage,
            input.max_percentage,
            input.is_attained as i64,
            db::now_rfc3339(),
        ),
    )?;
    tx.commit()?;
    debug!(threshold_id = %id, "threshold created");
    get(conn, &id)?.ok_or_else(|| CalcError::not_found("threshold not found"))
}

pub fn update(conn: &Connection, id: &str, input: &ThresholdInput) -> CalcResult<Threshold> {
    validate_input(input)?;
    if get(conn, id)?.is_none() {
        return Err(CalcError::not_found("threshold not found"));
    }
    if !degree_exists(conn, &input.degree_id)? {
        return Err(CalcError::not_found("degree not found"));
    }
    let tx = conn.unchecked_transaction()?;
    reject_overlap(&tx, input, Some(id))?;
    tx.execute(
        "UPDATE attainment_thresholds
         SET degree_id = ?, outcome_type = ?, level_name = ?, min_percentage = ?,
             max_percentage = ?, is_attained = ?, updated_at = ?
         WHERE id = ?",
        (
            &input.degree_id,
            input.outcome_type.as_str(),
            input.level_name.trim(),
            input.min_percentage,
            input.max_percentage,
            input.is_attained as i64,
            db::now_rfc3339(),
            id,
        ),
    )?;
    tx.commit()?;
    get(conn, id)?.ok_or_else(|| CalcError::not_found("threshold not found"))
}

pub fn delete(conn: &Connection, id: &str) -> CalcResult<bool> {
    let n = conn.execute("DELETE FROM attainment_thresholds WHERE id = ?", [id])?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        conn.execute(
            "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'Computer Science')",
            [],
        )
        .expect("degree");
        conn
    }

    fn input(min: f64, max: f64, name: &str, attained: bool) -> ThresholdInput {
        ThresholdInput {
            degree_id: "d1".into(),
            outcome_type: OutcomeType::Plo,
            level_name: name.into(),
            min_percentage: min,
            max_percentage: max,
            is_attained: attained,
        }
    }

    #[test]
    fn evaluates_boundary_scenario() {
        let conn = setup();
        create(&conn, &input(0.0, 59.0, "Not Attained", false)).expect("low");
        create(&conn, &input(60.0, 100.0, "Attained", true)).expect("high");

        let low = evaluate(&conn, "d1", OutcomeType::Plo, 59.999)
            .expect("eval")
            .expect("band");
        assert_eq!(low.level_name, "Not Attained");
        assert!(!low.is_attained);
        let high = evaluate(&conn, "d1", OutcomeType::Plo, 60.0)
            .expect("eval")
            .expect("band");
        assert_eq!(high.level_name, "Attained");

        assert!(evaluate(&conn, "d1", OutcomeType::Clo, 70.0)
            .expect("eval")
            .is_none());
    }

    #[test]
    fn overlapping_create_is_a_conflict() {
        let conn = setup();
        create(&conn, &input(0.0, 59.0, "Low", false)).expect("low");
        let e = create(&conn, &input(59.0, 100.0, "High", true)).unwrap_err();
        assert_eq!(e.code(), "conflict");
        assert_eq!(list(&conn, "d1", Some(OutcomeType::Plo)).expect("list").len(), 1);

        // Same range under another outcome type is independent.
        let mut peo = input(59.0, 100.0, "High", true);
        peo.outcome_type = OutcomeType::Peo;
        create(&conn, &peo).expect("peo band");
    }

    #[test]
    fn update_may_keep_its_own_range() {
        let conn = setup();
        let t = create(&conn, &input(0.0, 59.0, "Low", false)).expect("low");
        create(&conn, &input(60.0, 100.0, "High", true)).expect("high");
        let renamed = update(&conn, &t.id, &input(0.0, 59.0, "Developing", false)).expect("update");
        assert_eq!(renamed.level_name, "Developing");
        let e = update(&conn, &t.id, &input(0.0, 65.0, "Developing", false)).unwrap_err();
        assert_eq!(e.code(), "conflict");
    }

    #[test]
    fn validation_rejects_before_writing() {
        let conn = setup();
        assert_eq!(
            create(&conn, &input(70.0, 60.0, "Bad", false)).unwrap_err().code(),
            "bad_params"
        );
        assert_eq!(
            create(&conn, &input(-1.0, 60.0, "Bad", false)).unwrap_err().code(),
            "bad_params"
        );
        assert_eq!(
            create(&conn, &input(0.0, 60.0, "  ", false)).unwrap_err().code(),
            "bad_params"
        );
        let mut other = input(0.0, 10.0, "Low", false);
        other.degree_id = "nope".into();
        assert_eq!(create(&conn, &other).unwrap_err().code(), "not_found");
        assert!(list(&conn, "d1", None).expect("list").is_empty());
    }

    #[test]
    fn validate_no_overlap_accepts_disjoint_ranges() {
        let conn = setup();
        let t = create(&conn, &input(40.0, 59.0, "Mid", false)).expect("mid");
        assert!(validate_no_overlap(&conn, "d1", OutcomeType::Plo, 0.0, 39.99, None).expect("v"));
        assert!(validate_no_overlap(&conn, "d1", OutcomeType::Plo, 60.0, 100.0, None).expect("v"));
        assert!(!validate_no_overlap(&conn, "d1", OutcomeType::Plo, 50.0, 70.0, None).expect("v"));
        assert!(
            validate_no_overlap(&conn, "d1", OutcomeType::Plo, 50.0, 55.0, Some(&t.id)).expect("v")
        );
    }

    #[test]
    fn delete_reports_whether_a_row_went_away() {
        let conn = setup();
        let t = create(&conn, &input(0.0, 100.0, "All", true)).expect("all");
        assert!(delete(&conn, &t.id).expect("delete"));
        assert!(!delete(&conn, &t.id).expect("delete again"));
    }
}
