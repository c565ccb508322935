use crate::error::CalcError;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Outcome of a per-student batch. One student's failure is recorded here and
/// never stops the loop; callers re-invoke for the failed keys.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub calculated: Vec<T>,
    pub failed: Vec<(String, CalcError)>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            calculated: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T: Serialize> BatchOutcome<T> {
    pub fn to_json(&self) -> serde_json::Value {
        let errors: Vec<serde_json::Value> = self
            .failed
            .iter()
            .map(|(student_id, e)| {
                json!({
                    "studentId": student_id,
                    "code": e.code(),
                    "error": e.to_string(),
                })
            })
            .collect();
        json!({
            "calculated": self.calculated.len(),
            "failed": self.failed.len(),
            "results": self.calculated,
            "errors": errors,
        })
    }
}

/// Runs `f` for every key in order.
pub fn run_per_student<K, T, F>(label: &str, keys: &[K], mut f: F) -> BatchOutcome<T>
where
    K: AsRef<str>,
    F: FnMut(&str) -> Result<T, CalcError>,
{
    let mut out = BatchOutcome::default();
    for key in keys {
        let key = key.as_ref();
        match f(key) {
            Ok(v) => out.calculated.push(v),
            Err(e) => {
                warn!(batch = label, student_id = key, code = e.code(), error = %e, "batch item failed");
                out.failed.push((key.to_string(), e));
            }
        }
    }
    info!(
        batch = label,
        calculated = out.calculated.len(),
        failed = out.failed.len(),
        "batch finished"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_do_not_stop_the_loop() {
        let keys = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let out = run_per_student("test", &keys, |k| {
            if k == "s2" {
                Err(CalcError::bad_params("marks exceed max_marks"))
            } else {
                Ok(k.to_uppercase())
            }
        });
        assert_eq!(out.calculated, vec!["S1".to_string(), "S3".to_string()]);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].0, "s2");

        let v = out.to_json();
        assert_eq!(v["calculated"], 2);
        assert_eq!(v["failed"], 1);
        assert_eq!(v["errors"][0]["studentId"], "s2");
        assert_eq!(v["errors"][0]["code"], "bad_params");
    }
}
