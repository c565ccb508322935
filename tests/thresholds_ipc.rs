mod test_support;

use serde_json::json;
use test_support::{open_workspace, request_err, request_ok, seed};

fn band(degree: &str, min: f64, max: f64, name: &str, attained: bool) -> serde_json::Value {
    json!({
        "degreeId": degree,
        "outcomeType": "PLO",
        "levelName": name,
        "minPercentage": min,
        "maxPercentage": max,
        "isAttained": attained,
    })
}

#[test]
fn evaluate_resolves_bands_and_gaps() {
    let (ws, mut sc) = open_workspace();
    seed(ws.path(), "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');");
    request_ok(&mut sc, "1", "thresholds.create", band("d1", 0.0, 59.0, "Not Attained", false));
    request_ok(&mut sc, "2", "thresholds.create", band("d1", 60.0, 100.0, "Attained", true));

    let low = request_ok(
        &mut sc,
        "3",
        "thresholds.evaluate",
        json!({ "degreeId": "d1", "outcomeType": "PLO", "percentage": 59.999 }),
    );
    assert_eq!(low["found"], true);
    assert_eq!(low["threshold"]["levelName"], "Not Attained");

    let high = request_ok(
        &mut sc,
        "4",
        "thresholds.evaluate",
        json!({ "degreeId": "d1", "outcomeType": "plo", "percentage": 60.0 }),
    );
    assert_eq!(high["threshold"]["levelName"], "Attained");
    assert_eq!(high["threshold"]["isAttained"], true);

    // No CLO bands configured.
    let none = request_ok(
        &mut sc,
        "5",
        "thresholds.evaluate",
        json!({ "degreeId": "d1", "outcomeType": "CLO", "percentage": 75.0 }),
    );
    assert_eq!(none["found"], false);
    assert!(none["threshold"].is_null());

    let code = request_err(
        &mut sc,
        "6",
        "thresholds.evaluate",
        json!({ "degreeId": "d1", "outcomeType": "PLO", "percentage": 100.5 }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn wide_gap_between_bands_is_no_match() {
    let (ws, mut sc) = open_workspace();
    seed(ws.path(), "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');");
    request_ok(&mut sc, "1", "thresholds.create", band("d1", 0.0, 40.0, "Low", false));
    request_ok(&mut sc, "2", "thresholds.create", band("d1", 60.0, 100.0, "High", true));

    let gap = request_ok(
        &mut sc,
        "3",
        "thresholds.evaluate",
        json!({ "degreeId": "d1", "outcomeType": "PLO", "percentage": 55.0 }),
    );
    assert_eq!(gap["found"], false);
    assert!(gap["threshold"].is_null());
}

#[test]
fn overlapping_bands_are_rejected() {
    let (ws, mut sc) = open_workspace();
    seed(ws.path(), "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');");
    let first = request_ok(&mut sc, "1", "thresholds.create", band("d1", 0.0, 59.0, "Low", false));
    let first_id = first["threshold"]["id"].as_str().expect("id").to_string();

    let resp = test_support::request(&mut sc, "2", "thresholds.create", band("d1", 59.0, 80.0, "Mid", false));
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "conflict");
    assert_eq!(resp["error"]["details"]["existing"]["id"], first_id.as_str());

    // Other degrees and outcome types are independent.
    seed(ws.path(), "INSERT INTO degrees(id, code, name) VALUES('d2', 'BSEE', 'EE');");
    request_ok(&mut sc, "3", "thresholds.create", band("d2", 0.0, 100.0, "All", true));
    let mut clo = band("d1", 0.0, 100.0, "All", true);
    clo["outcomeType"] = json!("CLO");
    request_ok(&mut sc, "4", "thresholds.create", clo);

    let check = |lo: f64, hi: f64| {
        json!({
            "degreeId": "d1",
            "outcomeType": "PLO",
            "minPercentage": lo,
            "maxPercentage": hi,
        })
    };
    let clash = request_ok(&mut sc, "6", "thresholds.validateRange", check(50.0, 70.0));
    assert_eq!(clash["valid"], false);
    let free = request_ok(&mut sc, "7", "thresholds.validateRange", check(60.0, 100.0));
    assert_eq!(free["valid"], true);
    let mut own = check(0.0, 65.0);
    own["excludeId"] = json!(first_id.as_str());
    let own = request_ok(&mut sc, "8", "thresholds.validateRange", own);
    assert_eq!(own["valid"], true);

    let listed = request_ok(
        &mut sc,
        "5",
        "thresholds.list",
        json!({ "degreeId": "d1", "outcomeType": "PLO" }),
    );
    assert_eq!(listed["thresholds"].as_array().map(|a| a.len()), Some(1));
}

#[test]
fn update_checks_overlap_against_other_bands_only() {
    let (ws, mut sc) = open_workspace();
    seed(ws.path(), "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');");
    let low = request_ok(&mut sc, "1", "thresholds.create", band("d1", 0.0, 49.0, "Low", false));
    let low_id = low["threshold"]["id"].as_str().expect("id").to_string();
    request_ok(&mut sc, "2", "thresholds.create", band("d1", 60.0, 100.0, "High", true));

    let mut widen = band("d1", 0.0, 59.0, "Low", false);
    widen["id"] = json!(low_id);
    let updated = request_ok(&mut sc, "3", "thresholds.update", widen);
    assert_eq!(updated["threshold"]["maxPercentage"].as_f64(), Some(59.0));

    let mut clash = band("d1", 0.0, 65.0, "Low", false);
    clash["id"] = json!(low_id);
    assert_eq!(request_err(&mut sc, "4", "thresholds.update", clash), "conflict");

    let deleted = request_ok(&mut sc, "5", "thresholds.delete", json!({ "id": low_id }));
    assert_eq!(deleted["deleted"], true);
    let again = request_ok(&mut sc, "6", "thresholds.delete", json!({ "id": low_id }));
    assert_eq!(again["deleted"], false);
}

#[test]
fn invalid_bands_never_persist() {
    let (ws, mut sc) = open_workspace();
    seed(ws.path(), "INSERT INTO degrees(id, code, name) VALUES('d1', 'BSCS', 'CS');");

    assert_eq!(
        request_err(&mut sc, "1", "thresholds.create", band("d1", 70.0, 60.0, "Backwards", false)),
        "bad_params"
    );
    assert_eq!(
        request_err(&mut sc, "2", "thresholds.create", band("d1", -1.0, 60.0, "Negative", false)),
        "bad_params"
    );
    assert_eq!(
        request_err(&mut sc, "3", "thresholds.create", band("nope", 0.0, 60.0, "Orphan", false)),
        "not_found"
    );
    let mut bad_type = band("d1", 0.0, 60.0, "Typo", false);
    bad_type["outcomeType"] = json!("XYZ");
    assert_eq!(request_err(&mut sc, "4", "thresholds.create", bad_type), "bad_params");

    let n: i64 = test_support::db(ws.path())
        .query_row("SELECT COUNT(*) FROM attainment_thresholds", [], |r| r.get(0))
        .expect("count");
    assert_eq!(n, 0);
}
