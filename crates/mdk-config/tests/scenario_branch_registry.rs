//! Branch registry validation.
//!
//! GREEN when:
//! - A well-formed branches section parses into AppConfig with lookups by code.
//! - Duplicate or malformed branch codes are rejected at load time.
//! - Inactive branches stay in the registry but are invisible to `branch()`.

use mdk_config::{load_layered_yaml_from_strings, AppConfig};

const GOOD_YAML: &str = r#"
server:
  listen_addr: "0.0.0.0:8080"
database:
  max_connections: 10
branches:
  - code: "MAIN"
    name: "Main Diagnostic Center"
    active: true
  - code: "KOD"
    name: "Kodambakkam Branch"
    active: true
  - code: "OLD1"
    name: "Closed Annexe"
    active: false
billing:
  allocator:
    max_attempts: 5
    backoff_ms: 40
"#;

fn parse(yaml: &str) -> anyhow::Result<AppConfig> {
    let loaded = load_layered_yaml_from_strings(&[yaml])?;
    AppConfig::from_config_json(&loaded.config_json)
}

#[test]
fn well_formed_registry_parses() {
    let app = parse(GOOD_YAML).unwrap();

    assert_eq!(app.listen_addr, "0.0.0.0:8080");
    assert_eq!(app.db_max_connections, 10);
    assert_eq!(app.branches.len(), 3);
    assert_eq!(app.allocator.max_attempts, 5);
    assert_eq!(app.allocator.backoff_ms, 40);

    let main = app.branch("MAIN").expect("MAIN should resolve");
    assert_eq!(main.name, "Main Diagnostic Center");
}

#[test]
fn inactive_branch_not_resolvable() {
    let app = parse(GOOD_YAML).unwrap();

    assert!(
        app.branch("OLD1").is_none(),
        "inactive branch must not resolve for new work"
    );
    assert!(
        app.branches.iter().any(|b| b.code.as_str() == "OLD1"),
        "inactive branch stays in the registry"
    );
}

#[test]
fn unknown_code_not_resolvable() {
    let app = parse(GOOD_YAML).unwrap();
    assert!(app.branch("NOPE").is_none());
}

#[test]
fn duplicate_branch_code_rejected() {
    let yaml = r#"
branches:
  - code: "MAIN"
    name: "Main Diagnostic Center"
  - code: "MAIN"
    name: "Main Again"
"#;
    let err = parse(yaml).unwrap_err().to_string();
    assert!(
        err.contains("duplicate branch code"),
        "expected duplicate-code error, got: {err}"
    );
}

#[test]
fn malformed_branch_code_rejected() {
    // Lowercase and dashes are both outside the branch-code alphabet.
    for bad in ["kod", "KOD-1", "K", "WAYTOOLONGCODE"] {
        let yaml = format!(
            r#"
branches:
  - code: "{bad}"
    name: "Bad Branch"
"#
        );
        assert!(
            parse(&yaml).is_err(),
            "branch code {bad:?} should be rejected"
        );
    }
}

#[test]
fn empty_registry_rejected() {
    let yaml = "branches: []\n";
    assert!(parse(yaml).is_err(), "empty branches must be rejected");
}

#[test]
fn missing_registry_rejected() {
    let yaml = "server:\n  listen_addr: \"127.0.0.1:8080\"\n";
    assert!(parse(yaml).is_err(), "missing branches must be rejected");
}
