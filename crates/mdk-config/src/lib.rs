//! Layered YAML configuration with deterministic hashing.
//!
//! Config is merged from a base file plus optional overlays (later layers
//! override earlier ones, deep-merged per key). The merged document is
//! canonicalized and SHA-256 hashed; the daemon logs the hash at startup so
//! a deployment can be matched to the exact config it ran with.
//!
//! Secrets never live in config: YAML stores env var NAMES (like
//! `MDK_DATABASE_URL`), and loading aborts if any leaf value looks like a
//! literal credential.

use anyhow::{anyhow, bail, Context, Result};
use mdk_billing::BranchCode;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Known secret-like prefixes. If any leaf string value in the effective
/// config starts with one of these, loading aborts with CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",        // Stripe / OpenAI style
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "ghp_",       // GitHub PAT
    "gho_",       // GitHub OAuth
    "glpat-",     // GitLab PAT
    "xoxb-",      // Slack bot token
    "xoxp-",      // Slack user token
    "postgres://",   // inline DB DSNs carry passwords
    "postgresql://", // inline DB DSNs carry passwords
];

// ---------------------------------------------------------------------------
// Loading + hashing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    // Merge YAML docs in order: earlier docs are base, later docs override.
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn canonicalize_json(v: &Value) -> Result<String> {
    // Canonical form: sorted keys, compact separators, stable float rendering.
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).context("canonical json serialize failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    hex::encode(out)
}

// ---------------------------------------------------------------------------
// Secret-literal guard
// ---------------------------------------------------------------------------

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(v, "", &mut leaves);

    for ptr in leaves {
        if let Some(val) = v.pointer(&ptr) {
            if let Some(s) = val.as_str() {
                if looks_like_secret(s) {
                    bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
                }
            }
        }
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => {
            let p = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            };
            out.push(p);
        }
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

// ---------------------------------------------------------------------------
// Typed application config
// ---------------------------------------------------------------------------

/// One branch in the registry. Every request must name one of these via
/// X-Branch-Id; unknown or inactive codes are rejected before any DB work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchConfig {
    pub code: BranchCode,
    pub name: String,
    pub active: bool,
}

/// Bounded-retry policy for the bill-number allocator. Retries apply only to
/// transient serialization/lock errors, never to constraint violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            max_attempts: 3,
            backoff_ms: 25,
        }
    }
}

/// Validated application config built from the merged config JSON.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub db_max_connections: u32,
    pub branches: Vec<BranchConfig>,
    pub allocator: AllocatorConfig,
}

impl AppConfig {
    /// Build from canonical config JSON (produced by this crate's loader).
    ///
    /// Required fields:
    /// - branches: non-empty array of { code, name, active? }
    ///
    /// Optional:
    /// - server.listen_addr (default 127.0.0.1:8080)
    /// - database.max_connections (default 5)
    /// - billing.allocator.max_attempts / backoff_ms (defaults 3 / 25)
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let listen_addr = cfg
            .pointer("/server/listen_addr")
            .and_then(Value::as_str)
            .unwrap_or("127.0.0.1:8080")
            .to_string();

        let db_max_connections = match cfg.pointer("/database/max_connections") {
            Some(v) => u32::try_from(
                v.as_u64()
                    .context("database.max_connections must be a positive integer")?,
            )
            .context("database.max_connections out of range")?,
            None => 5,
        };
        if db_max_connections == 0 {
            bail!("database.max_connections must be >= 1");
        }

        let branch_values = cfg
            .pointer("/branches")
            .and_then(Value::as_array)
            .context("config missing branches")?;
        if branch_values.is_empty() {
            bail!("branches must list at least one branch");
        }

        let mut branches = Vec::with_capacity(branch_values.len());
        for (i, bv) in branch_values.iter().enumerate() {
            let code_str = bv
                .pointer("/code")
                .and_then(Value::as_str)
                .with_context(|| format!("branches[{i}] missing code"))?;
            let code = BranchCode::new(code_str)
                .map_err(|e| anyhow!("branches[{i}]: {e}"))?;
            let name = bv
                .pointer("/name")
                .and_then(Value::as_str)
                .with_context(|| format!("branches[{i}] missing name"))?
                .to_string();
            let active = bv.pointer("/active").and_then(Value::as_bool).unwrap_or(true);

            if branches.iter().any(|b: &BranchConfig| b.code == code) {
                bail!("duplicate branch code {}", code);
            }
            branches.push(BranchConfig { code, name, active });
        }

        let allocator = allocator_from_json(cfg)?;

        Ok(AppConfig {
            listen_addr,
            db_max_connections,
            branches,
            allocator,
        })
    }

    /// Look up an ACTIVE branch by its code. Inactive branches stay in the
    /// registry (their historical bills reference them) but take no new work.
    pub fn branch(&self, code: &str) -> Option<&BranchConfig> {
        self.branches
            .iter()
            .find(|b| b.active && b.code.as_str() == code)
    }
}

fn allocator_from_json(cfg: &Value) -> Result<AllocatorConfig> {
    let defaults = AllocatorConfig::default();

    let max_attempts = match cfg.pointer("/billing/allocator/max_attempts") {
        Some(v) => u32::try_from(
            v.as_u64()
                .context("billing.allocator.max_attempts must be a positive integer")?,
        )
        .context("billing.allocator.max_attempts out of range")?,
        None => defaults.max_attempts,
    };
    if max_attempts == 0 {
        bail!("billing.allocator.max_attempts must be >= 1");
    }

    let backoff_ms = match cfg.pointer("/billing/allocator/backoff_ms") {
        Some(v) => v
            .as_u64()
            .context("billing.allocator.backoff_ms must be a non-negative integer")?,
        None => defaults.backoff_ms,
    };

    Ok(AllocatorConfig {
        max_attempts,
        backoff_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let a = serde_json::json!({"server": {"listen_addr": "0.0.0.0:8080"}, "x": 1});
        let b = serde_json::json!({"server": {"listen_addr": "127.0.0.1:9000"}});
        let m = deep_merge(a, b);
        assert_eq!(
            m.pointer("/server/listen_addr").and_then(Value::as_str),
            Some("127.0.0.1:9000")
        );
        assert_eq!(m.pointer("/x").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn dsn_literals_are_treated_as_secrets() {
        assert!(looks_like_secret("postgres://u:p@localhost/mdk"));
        assert!(!looks_like_secret("MDK_DATABASE_URL"));
    }

    #[test]
    fn app_config_defaults_apply() {
        let cfg = serde_json::json!({
            "branches": [{"code": "MAIN", "name": "Main Center"}],
        });
        let app = AppConfig::from_config_json(&cfg).unwrap();
        assert_eq!(app.listen_addr, "127.0.0.1:8080");
        assert_eq!(app.db_max_connections, 5);
        assert_eq!(app.allocator, AllocatorConfig::default());
        assert!(app.branches[0].active, "active defaults to true");
    }

    #[test]
    fn app_config_rejects_zero_max_attempts() {
        let cfg = serde_json::json!({
            "branches": [{"code": "MAIN", "name": "Main Center"}],
            "billing": {"allocator": {"max_attempts": 0}},
        });
        assert!(AppConfig::from_config_json(&cfg).is_err());
    }
}
