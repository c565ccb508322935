use crate::calc::DEFAULT_NEAR_TARGET_RATIO;
use crate::db;
use crate::error::{CalcError, CalcResult};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const ATTAINMENT_KEY: &str = "setup.attainment";
pub const INDIRECT_KEY: &str = "setup.indirect";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttainmentSettings {
    /// Fraction of a PLO's target an average must reach to count as Near Target.
    pub near_target_ratio: f64,
    pub trends_default_limit: i64,
}

impl Default for AttainmentSettings {
    fn default() -> Self {
        Self {
            near_target_ratio: DEFAULT_NEAR_TARGET_RATIO,
            trends_default_limit: 12,
        }
    }
}

/// Fallback scales for survey questions whose options omit them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndirectSettings {
    pub default_rating_max: f64,
    pub default_likert_scale: i64,
}

impl Default for IndirectSettings {
    fn default() -> Self {
        Self {
            default_rating_max: 5.0,
            default_likert_scale: 5,
        }
    }
}

fn load<T: DeserializeOwned + Default>(conn: &Connection, key: &str) -> CalcResult<T> {
    match db::settings_get_json(conn, key)? {
        None => Ok(T::default()),
        Some(v) => serde_json::from_value(v)
            .map_err(|e| CalcError::Config(format!("{}: {}", key, e))),
    }
}

pub fn attainment(conn: &Connection) -> CalcResult<AttainmentSettings> {
    load(conn, ATTAINMENT_KEY)
}

pub fn indirect(conn: &Connection) -> CalcResult<IndirectSettings> {
    load(conn, INDIRECT_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_without_stored_settings() {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        assert_eq!(attainment(&conn).expect("load"), AttainmentSettings::default());
        assert_eq!(indirect(&conn).expect("load").default_likert_scale, 5);
    }

    #[test]
    fn partial_settings_fill_from_defaults() {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        db::settings_set_json(&conn, ATTAINMENT_KEY, &json!({ "nearTargetRatio": 0.9 }))
            .expect("set");
        let s = attainment(&conn).expect("load");
        assert_eq!(s.near_target_ratio, 0.9);
        assert_eq!(s.trends_default_limit, 12);
    }

    #[test]
    fn database_failures_are_not_config_errors() {
        // No schema: the settings table is missing.
        let conn = Connection::open_in_memory().expect("open");
        let e = attainment(&conn).unwrap_err();
        assert!(matches!(e, CalcError::Db(_)));
        assert_eq!(e.code(), "db_query_failed");
    }

    #[test]
    fn malformed_settings_are_config_errors() {
        let conn = Connection::open_in_memory().expect("open");
        db::create_schema(&conn).expect("schema");
        db::settings_set_json(&conn, INDIRECT_KEY, &json!({ "defaultRatingMax": "five" }))
            .expect("set");
        assert_eq!(indirect(&conn).unwrap_err().code(), "bad_config");
    }
}
