//! Indirect attainment from survey responses.
//!
//! Every mapped question's answers are normalized onto 0..=100 by question
//! type and pooled into one mean per outcome. Nothing here reads or writes the
//! marks-based attainment tables; reports put the two signals side by side.

use crate::calc::{self, AttainmentStatus, QuestionScale, QuestionType};
use crate::db;
use crate::error::{CalcError, CalcResult};
use crate::query::{OrderBy, SelectBuilder, SortColumns};
use crate::settings::{self, IndirectSettings};
use crate::thresholds::OutcomeType;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSummary {
    pub question_id: String,
    pub question_text: String,
    pub question_type: String,
    pub response_count: usize,
    pub average_response: Option<f64>,
    pub normalized_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndirectResult {
    pub survey_id: String,
    pub outcome_type: String,
    pub outcome_id: String,
    pub outcome_code: Option<String>,
    pub target_attainment: f64,
    pub total_responses: i64,
    pub attainment_percentage: f64,
    pub attainment_status: String,
    pub question_summaries: Vec<QuestionSummary>,
    /// Set once the result has been stored.
    pub calculated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndirectRun {
    pub results: Vec<IndirectResult>,
    /// Outcomes whose mapped questions produced no numeric answer.
    pub skipped: Vec<String>,
    pub persisted: bool,
}

pub const INDIRECT_SORT_COLUMNS: SortColumns = &[
    ("outcomeCode", "outcome_code"),
    ("percentage", "r.attainment_percentage"),
    ("responses", "r.total_responses"),
    ("calculatedAt", "r.calculated_at"),
];

#[derive(Debug, Default, Deserialize)]
struct QuestionOptions {
    #[serde(alias = "maxValue")]
    max_value: Option<f64>,
    #[serde(alias = "scaleSize")]
    scale_size: Option<f64>,
}

#[derive(Debug)]
struct MappedQuestion {
    outcome_id: String,
    outcome_code: Option<String>,
    target_attainment: Option<f64>,
    question_id: String,
    question_text: String,
    question_type: QuestionType,
    options_json: Option<String>,
}

fn indirect_outcome(outcome_type: OutcomeType) -> CalcResult<OutcomeType> {
    match outcome_type {
        OutcomeType::Clo | OutcomeType::Plo => Ok(outcome_type),
        OutcomeType::Peo => Err(CalcError::bad_params(
            "indirect attainment is computed for CLO or PLO outcomes only",
        )),
    }
}

fn require_survey(conn: &Connection, survey_id: &str) -> CalcResult<()> {
    let exists = conn
        .query_row("SELECT 1 FROM surveys WHERE id = ?", [survey_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !exists {
        return Err(CalcError::not_found(format!("survey {} not found", survey_id)));
    }
    Ok(())
}

/// Options carry per-question scales; anything unreadable falls back to the
/// workspace defaults.
fn question_scale(options_json: Option<&str>, defaults: &IndirectSettings) -> QuestionScale {
    let opts: QuestionOptions = options_json
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    QuestionScale {
        max_value: opts.max_value.unwrap_or(defaults.default_rating_max),
        scale_size: opts
            .scale_size
            .unwrap_or(defaults.default_likert_scale as f64),
    }
}

fn mapped_questions(
    conn: &Connection,
    survey_id: &str,
    outcome_type: OutcomeType,
    outcome_id: Option<&str>,
) -> CalcResult<Vec<MappedQuestion>> {
    let sql = match outcome_type {
        OutcomeType::Plo => {
            "SELECT m.outcome_id, o.code, o.target_attainment, q.id, q.question_text,
                    q.question_type, q.options_json
             FROM survey_outcome_mappings m
             JOIN survey_questions q ON q.id = m.question_id
             LEFT JOIN plos o ON o.id = m.outcome_id
             WHERE q.survey_id = ? AND m.outcome_type = 'PLO' AND (? IS NULL OR m.outcome_id = ?)
             ORDER BY m.outcome_id, q.sort_order, q.id"
        }
        _ => {
            "SELECT m.outcome_id, o.code, o.target_attainment, q.id, q.question_text,
                    q.question_type, q.options_json
             FROM survey_outcome_mappings m
             JOIN survey_questions q ON q.id = m.question_id
             LEFT JOIN clos o ON o.id = m.outcome_id
             WHERE q.survey_id = ? AND m.outcome_type = 'CLO' AND (? IS NULL OR m.outcome_id = ?)
             ORDER BY m.outcome_id, q.sort_order, q.id"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map((survey_id, outcome_id, outcome_id), |r| {
            Ok(MappedQuestion {
                outcome_id: r.get(0)?,
                outcome_code: r.get(1)?,
                target_attainment: r.get(2)?,
                question_id: r.get(3)?,
                question_text: r.get(4)?,
                question_type: QuestionType::parse(&r.get::<_, String>(5)?),
                options_json: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn answers(conn: &Connection, survey_id: &str, question_id: &str) -> CalcResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT a.response_id, a.answer_value
         FROM survey_answers a
         JOIN survey_responses r ON r.id = a.response_id
         WHERE a.question_id = ? AND r.survey_id = ? AND a.answer_value IS NOT NULL
         ORDER BY a.response_id",
    )?;
    let rows = stmt
        .query_map((question_id, survey_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .collect())
}

/// Accumulates one outcome across its mapped questions.
#[derive(Default)]
struct Pool {
    code: Option<String>,
    target: f64,
    normalized: Vec<f64>,
    responses: BTreeSet<String>,
    summaries: Vec<QuestionSummary>,
}

/// Computes indirect attainment for every outcome of `outcome_type` mapped on
/// the survey, or only `outcome_id`. Results are stored when computing for all
/// outcomes or when `persist` is set.
pub fn calculate_from_survey(
    conn: &Connection,
    survey_id: &str,
    outcome_type: OutcomeType,
    outcome_id: Option<&str>,
    persist: bool,
) -> CalcResult<IndirectRun> {
    let outcome_type = indirect_outcome(outcome_type)?;
    require_survey(conn, survey_id)?;
    let defaults = settings::indirect(conn)?;
    let persist = persist || outcome_id.is_none();

    let mut pools: BTreeMap<String, Pool> = BTreeMap::new();
    for q in mapped_questions(conn, survey_id, outcome_type, outcome_id)? {
        let Some(target) = q.target_attainment else {
            warn!(survey_id, outcome_id = %q.outcome_id, "survey mapping points at a missing outcome");
            continue;
        };
        let scale = question_scale(q.options_json.as_deref(), &defaults);
        let rows = answers(conn, survey_id, &q.question_id)?;

        let raw: Vec<f64> = rows
            .iter()
            .filter_map(|(_, v)| v.trim().parse::<f64>().ok())
            .collect();
        let mut normalized = Vec::new();
        let pool = pools.entry(q.outcome_id.clone()).or_default();
        pool.code = q.outcome_code.clone();
        pool.target = target;
        for (response_id, value) in &rows {
            if let Some(n) = calc::normalize_answer(q.question_type, value, scale) {
                normalized.push(n);
                pool.responses.insert(response_id.clone());
            }
        }
        debug!(
            survey_id,
            question_id = %q.question_id,
            answers = rows.len(),
            scored = normalized.len(),
            "question normalized"
        );
        pool.summaries.push(QuestionSummary {
            question_id: q.question_id,
            question_text: q.question_text,
            question_type: q.question_type.as_str().to_string(),
            response_count: rows.len(),
            average_response: calc::mean(&raw).map(calc::round2),
            normalized_average: calc::mean(&normalized).map(calc::round2),
        });
        pool.normalized.extend(normalized);
    }

    let mut run = IndirectRun {
        persisted: persist,
        ..IndirectRun::default()
    };
    for (oid, pool) in pools {
        let Some(avg) = calc::mean(&pool.normalized) else {
            run.skipped.push(oid);
            continue;
        };
        let pct = calc::round2(avg);
        run.results.push(IndirectResult {
            survey_id: survey_id.to_string(),
            outcome_type: outcome_type.as_str().to_string(),
            outcome_id: oid,
            outcome_code: pool.code,
            target_attainment: pool.target,
            total_responses: pool.responses.len() as i64,
            attainment_percentage: pct,
            attainment_status: AttainmentStatus::from_percentage(pct, pool.target)
                .as_str()
                .to_string(),
            question_summaries: pool.summaries,
            calculated_at: None,
        });
    }

    if persist {
        let now = db::now_rfc3339();
        let tx = conn.unchecked_transaction()?;
        for r in &run.results {
            store(&tx, r, &now)?;
        }
        // An outcome that no longer has scorable answers keeps no stale row.
        for oid in &run.skipped {
            tx.execute(
                "DELETE FROM indirect_attainment_results
                 WHERE survey_id = ? AND outcome_type = ? AND outcome_id = ?",
                (survey_id, outcome_type.as_str(), oid),
            )?;
        }
        tx.commit()?;
        for r in &mut run.results {
            r.calculated_at = stored_at(conn, survey_id, outcome_type, &r.outcome_id)?;
        }
    }
    info!(
        survey_id,
        outcome_type = outcome_type.as_str(),
        calculated = run.results.len(),
        skipped = run.skipped.len(),
        persisted = run.persisted,
        "indirect attainment calculated"
    );
    Ok(run)
}

/// Recalculation always stores its results.
pub fn recalculate(
    conn: &Connection,
    survey_id: &str,
    outcome_type: OutcomeType,
    outcome_id: Option<&str>,
) -> CalcResult<IndirectRun> {
    calculate_from_survey(conn, survey_id, outcome_type, outcome_id, true)
}

fn store(conn: &Connection, r: &IndirectResult, now: &str) -> CalcResult<()> {
    let summaries = serde_json::to_string(&r.question_summaries)?;
    conn.execute(
        "INSERT INTO indirect_attainment_results(
            id, survey_id, outcome_type, outcome_id, total_responses, attainment_percentage,
            attainment_status, question_summaries_json, calculated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(survey_id, outcome_type, outcome_id) DO UPDATE SET
           total_responses = excluded.total_responses,
           attainment_percentage = excluded.attainment_percentage,
           attainment_status = excluded.attainment_status,
           question_summaries_json = excluded.question_summaries_json,
           calculated_at = excluded.calculated_at
         WHERE indirect_attainment_results.total_responses IS NOT excluded.total_responses
            OR indirect_attainment_results.attainment_percentage IS NOT excluded.attainment_percentage
            OR indirect_attainment_results.attainment_status IS NOT excluded.attainment_status
            OR indirect_attainment_results.question_summaries_json IS NOT excluded.question_summaries_json",
        (
            Uuid::new_v4().to_string(),
            &r.survey_id,
            &r.outcome_type,
            &r.outcome_id,
            r.total_responses,
            r.attainment_percentage,
            &r.attainment_status,
            summaries,
            now,
        ),
    )?;
    Ok(())
}

fn stored_at(
    conn: &Connection,
    survey_id: &str,
    outcome_type: OutcomeType,
    outcome_id: &str,
) -> CalcResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT calculated_at FROM indirect_attainment_results
             WHERE survey_id = ? AND outcome_type = ? AND outcome_id = ?",
            (survey_id, outcome_type.as_str(), outcome_id),
            |r| r.get(0),
        )
        .optional()?)
}

const SELECT_RESULTS: &str =
    "SELECT r.survey_id, r.outcome_type, r.outcome_id, COALESCE(p.code, c.code) AS outcome_code,
            COALESCE(p.target_attainment, c.target_attainment, 0), r.total_responses,
            r.attainment_percentage, r.attainment_status, r.question_summaries_json, r.calculated_at
     FROM indirect_attainment_results r
     LEFT JOIN plos p ON r.outcome_type = 'PLO' AND p.id = r.outcome_id
     LEFT JOIN clos c ON r.outcome_type = 'CLO' AND c.id = r.outcome_id";

pub fn list_results(
    conn: &Connection,
    survey_id: &str,
    outcome_type: Option<OutcomeType>,
    order: OrderBy,
) -> CalcResult<Vec<IndirectResult>> {
    require_survey(conn, survey_id)?;
    let mut q = SelectBuilder::new(SELECT_RESULTS).filter("r.survey_id = ?", survey_id.to_string());
    if let Some(t) = outcome_type {
        q = q.filter("r.outcome_type = ?", indirect_outcome(t)?.as_str().to_string());
    }
    let (sql, binds) = q.order_by(order).build();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, f64>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
                r.get::<_, String>(9)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (sid, otype, oid, code, target, total, pct, status, summaries, at) in rows {
        out.push(IndirectResult {
            survey_id: sid,
            outcome_type: otype,
            outcome_id: oid,
            outcome_code: code,
            target_attainment: target,
            total_responses: total,
            attainment_percentage: pct,
            attainment_status: status,
            question_summaries: serde_json::from_str(&summaries)?,
            calculated_at: Some(at),
        });
    }
    Ok(out)
}
