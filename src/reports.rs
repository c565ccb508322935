use crate::error::CalcResult;
use crate::plo_rollup::{load_plos, require_degree};
use crate::program_summary;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSignal {
    pub total_students: i64,
    pub average_attainment: f64,
    pub achievement_rate: f64,
    pub overall_status: String,
    pub calculated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndirectSignal {
    pub survey_id: String,
    pub survey_title: String,
    pub total_responses: i64,
    pub attainment_percentage: f64,
    pub attainment_status: String,
    pub calculated_at: String,
}

/// Direct and indirect attainment for one PLO, side by side. The two are
/// never combined into one number.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeComparison {
    pub plo_id: String,
    pub plo_code: String,
    pub target_attainment: f64,
    pub direct: Option<DirectSignal>,
    pub indirect: Vec<IndirectSignal>,
}

pub fn outcome_comparison(conn: &Connection, degree_id: &str) -> CalcResult<Vec<OutcomeComparison>> {
    require_degree(conn, degree_id)?;
    let mut indirect_stmt = conn.prepare(
        "SELECT r.survey_id, s.title, r.total_responses, r.attainment_percentage,
                r.attainment_status, r.calculated_at
         FROM indirect_attainment_results r
         JOIN surveys s ON s.id = r.survey_id
         WHERE r.outcome_type = 'PLO' AND r.outcome_id = ?
         ORDER BY s.title, s.id",
    )?;

    let mut out = Vec::new();
    for plo in load_plos(conn, degree_id, None)? {
        let direct = program_summary::get(conn, degree_id, &plo.id)?.map(|s| DirectSignal {
            total_students: s.total_students,
            average_attainment: s.average_attainment,
            achievement_rate: s.achievement_rate,
            overall_status: s.overall_status,
            calculated_at: s.calculated_at,
        });
        let indirect = indirect_stmt
            .query_map([&plo.id], |r| {
                Ok(IndirectSignal {
                    survey_id: r.get(0)?,
                    survey_title: r.get(1)?,
                    total_responses: r.get(2)?,
                    attainment_percentage: r.get(3)?,
                    attainment_status: r.get(4)?,
                    calculated_at: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(OutcomeComparison {
            plo_id: plo.id,
            plo_code: plo.code,
            target_attainment: plo.target_attainment,
            direct,
            indirect,
        });
    }
    Ok(out)
}
