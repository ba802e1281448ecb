use api_mutator::db::Database;
use api_mutator::results::{RequestSnapshot, ResponseSnapshot, TestResult, ValidationResult};
use api_mutator::test_run::{Endpoint, NewTestRun};
use api_mutator::validation::config::{ElapsedTimeConfig, StatusCodeConfig, StringMatchConfig};
use api_mutator::validation::{
    ElapsedTime, Regression, StatusCode, StringMatch, ValidationConfig, Validator,
    ValidatorRegistry,
};
use api_mutator::values::TestType;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn result(run_id: i64, request_hash: &str, status_code: u16, response_hash: &str) -> TestResult {
    TestResult {
        test_run_id: run_id,
        test_type: TestType::String,
        test_value: "x".to_string(),
        request: RequestSnapshot {
            hash: request_hash.to_string(),
            method: "GET".to_string(),
            headers: None,
            url: "http://localhost/r".to_string(),
            body: None,
        },
        response: Some(ResponseSnapshot {
            hash: response_hash.to_string(),
            url: "http://localhost/r".to_string(),
            headers: BTreeMap::new(),
            body: json!({"ok": true}),
            status_code,
            elapsed_time: 0.05,
        }),
    }
}

fn db_with_run() -> (Arc<Database>, i64) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let run_id = db
        .insert_run(&NewTestRun {
            endpoint: Endpoint {
                method: "GET".to_string(),
                url: "http://localhost/r".to_string(),
                headers: None,
                body: None,
            },
            config: None,
            batch_id: None,
        })
        .unwrap();
    (db, run_id)
}

#[test]
fn test_status_code_rules() {
    let validator = StatusCode::new(StatusCodeConfig {
        enabled: true,
        invalid_status_codes: vec![401, 402],
    });

    assert!(validator.validate(&result(1, "h", 200, "r")).unwrap().passed);
    assert!(validator.validate(&result(1, "h", 404, "r")).unwrap().passed);
    assert!(!validator.validate(&result(1, "h", 500, "r")).unwrap().passed);
    assert!(!validator.validate(&result(1, "h", 503, "r")).unwrap().passed);

    let blocked = validator.validate(&result(1, "h", 401, "r")).unwrap();
    assert!(!blocked.passed);
    assert_eq!(blocked.validation_type, "StatusCode");
    assert!(blocked.message.unwrap().contains("401"));
}

#[test]
fn test_elapsed_time_at_limit_fails() {
    let validator = ElapsedTime::new(ElapsedTimeConfig {
        enabled: true,
        max_elapsed_time: 0.05,
    });
    assert!(!validator.validate(&result(1, "h", 200, "r")).unwrap().passed);

    let relaxed = ElapsedTime::new(ElapsedTimeConfig::default());
    assert!(relaxed.validate(&result(1, "h", 200, "r")).unwrap().passed);
}

#[test]
fn test_string_match_searches_whole_body() {
    let mut with_trace = result(1, "h", 200, "r");
    with_trace.response.as_mut().unwrap().body =
        json!({"error": {"detail": "NullPointerException at line 3"}});
    let validator = StringMatch::new(StringMatchConfig::default());

    let found = validator.validate(&with_trace).unwrap();
    assert!(!found.passed);
    assert!(found.message.unwrap().contains("Exception"));
    assert!(validator.validate(&result(1, "h", 200, "r")).unwrap().passed);
}

#[test]
fn test_regression_first_observation_passes() {
    let (db, run_id) = db_with_run();
    let validator = Regression::new(db);
    let outcome = validator.validate(&result(run_id, "req-1", 200, "resp-a")).unwrap();
    assert!(outcome.passed);
    assert_eq!(outcome.message.as_deref(), Some("Passed"));
}

#[test]
fn test_regression_compares_with_latest_prior_hash() {
    let (db, run_id) = db_with_run();
    let validator = Regression::new(db.clone());
    db.insert_result(&result(run_id, "req-1", 200, "resp-a"), &[])
        .unwrap();

    assert!(validator.validate(&result(run_id, "req-1", 200, "resp-a")).unwrap().passed);

    let changed = validator.validate(&result(run_id, "req-1", 200, "resp-b")).unwrap();
    assert!(!changed.passed);
    let message = changed.message.unwrap();
    assert!(message.contains("resp-a"));
    assert!(message.contains("resp-b"));

    // The newest stored fingerprint is the baseline.
    db.insert_result(&result(run_id, "req-1", 200, "resp-b"), &[])
        .unwrap();
    assert!(validator.validate(&result(run_id, "req-1", 200, "resp-b")).unwrap().passed);

    // Another request hash has no history of its own.
    assert!(validator.validate(&result(run_id, "req-2", 200, "resp-z")).unwrap().passed);
}

#[test]
fn test_registry_honours_enabled_flags() {
    let (db, _) = db_with_run();
    let all = ValidatorRegistry::from_config(&ValidationConfig::default(), db.clone());
    assert_eq!(
        all.names(),
        vec!["StatusCode", "ElapsedTime", "StringMatch", "Regression"]
    );

    let config = ValidationConfig::default()
        .with_overrides(&json!({
            "StringMatch": {"enabled": false},
            "Regression": {"enabled": false}
        }))
        .unwrap();
    let some = ValidatorRegistry::from_config(&config, db);
    assert_eq!(some.names(), vec!["StatusCode", "ElapsedTime"]);
}

#[test]
fn test_run_config_overrides_defaults() {
    let defaults = ValidationConfig::default();
    let run_config = json!({
        "validation": {"StatusCode": {"invalid_status_codes": [418]}},
        "unrelated": 1
    });
    let effective = defaults.for_run(Some(&run_config)).unwrap();
    assert_eq!(effective.status_code.invalid_status_codes, vec![418]);
    assert!(effective.status_code.enabled);
    assert_eq!(defaults.for_run(None).unwrap(), defaults);
}

struct Broken;

impl Validator for Broken {
    fn name(&self) -> &'static str {
        "Broken"
    }

    fn validate(&self, _result: &TestResult) -> anyhow::Result<ValidationResult> {
        anyhow::bail!("validator exploded")
    }
}

#[test]
fn test_failing_validator_is_dropped_not_fatal() {
    let registry = ValidatorRegistry::with_validators(vec![
        Box::new(Broken),
        Box::new(StatusCode::new(StatusCodeConfig::default())),
    ]);
    let outcomes = registry.validate(&result(1, "h", 200, "r"));
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].validation_type, "StatusCode");
    assert!(outcomes[0].passed);
}

#[test]
fn test_validators_need_a_response() {
    let mut no_response = result(1, "h", 200, "r");
    no_response.response = None;
    let registry = ValidatorRegistry::with_validators(vec![Box::new(StatusCode::new(
        StatusCodeConfig::default(),
    ))]);
    assert!(registry.validate(&no_response).is_empty());
}
