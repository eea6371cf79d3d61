//! Config hash determinism.
//!
//! GREEN when:
//! - `load_layered_yaml_from_strings` called twice on the same inputs returns
//!   identical config_hash.
//! - Reordering keys within YAML doesn't change the hash (canonicalization).
//! - Different values produce different hashes (collision resistance sanity).
//! - Multiple merge layers produce a stable hash and the overlay takes effect.

use mdk_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
server:
  listen_addr: "127.0.0.1:8080"
database:
  max_connections: 5
branches:
  - code: "MAIN"
    name: "Main Diagnostic Center"
    active: true
  - code: "KOD"
    name: "Kodambakkam Branch"
    active: true
billing:
  allocator:
    max_attempts: 3
    backoff_ms: 25
"#;

/// Same content as BASE_YAML but with keys in different order.
const BASE_YAML_REORDERED: &str = r#"
billing:
  allocator:
    backoff_ms: 25
    max_attempts: 3
database:
  max_connections: 5
branches:
  - name: "Main Diagnostic Center"
    active: true
    code: "MAIN"
  - active: true
    code: "KOD"
    name: "Kodambakkam Branch"
server:
  listen_addr: "127.0.0.1:8080"
"#;

const OVERLAY_YAML: &str = r#"
server:
  listen_addr: "0.0.0.0:8080"
database:
  max_connections: 20
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(
        a.config_hash, b.config_hash,
        "same YAML input must produce identical hash"
    );
    assert_eq!(
        a.canonical_json, b.canonical_json,
        "canonical JSON must be identical for same input"
    );
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(
        original.config_hash, reordered.config_hash,
        "reordering keys in YAML must not change the hash (canonicalization)"
    );
    assert_eq!(
        original.canonical_json, reordered.canonical_json,
        "canonical JSON must be identical regardless of key ordering in source"
    );
}

#[test]
fn different_values_produce_different_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    let modified = BASE_YAML.replace("max_connections: 5", "max_connections: 6");
    let b = load_layered_yaml_from_strings(&[&modified]).unwrap();

    assert_ne!(
        a.config_hash, b.config_hash,
        "different config values must produce different hashes"
    );
}

#[test]
fn merged_layers_produce_stable_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_eq!(
        a.config_hash, b.config_hash,
        "same merge layers must produce identical hash"
    );

    // Verify the overlay actually took effect
    let addr = a
        .config_json
        .pointer("/server/listen_addr")
        .and_then(|v| v.as_str())
        .unwrap();
    assert_eq!(addr, "0.0.0.0:8080", "overlay should override listen_addr");

    let conns = a
        .config_json
        .pointer("/database/max_connections")
        .and_then(|v| v.as_u64())
        .unwrap();
    assert_eq!(conns, 20, "overlay should override max_connections");

    // Branches come from the base layer untouched
    let branches = a
        .config_json
        .pointer("/branches")
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(branches.len(), 2, "base branches survive the merge");
}

#[test]
fn hash_is_64_hex_chars() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(
        loaded.config_hash.len(),
        64,
        "SHA-256 hash should be 64 hex chars"
    );
    assert!(
        loaded.config_hash.chars().all(|c| c.is_ascii_hexdigit()),
        "hash should contain only hex digits"
    );
}

#[test]
fn empty_config_produces_stable_hash() {
    let a = load_layered_yaml_from_strings(&["{}"]).unwrap();
    let b = load_layered_yaml_from_strings(&["{}"]).unwrap();

    assert_eq!(
        a.config_hash, b.config_hash,
        "empty configs must produce identical hash"
    );
}
