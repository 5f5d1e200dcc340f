//! bcp-config
//!
//! Layered YAML configuration for the control-plane daemon. Each layer
//! folds over the previous one (nested tables key by key, everything
//! else replaced), and the result is hashed over a canonical rendering
//! (sorted keys, compact JSON) so deployments can prove which
//! configuration a daemon booted with.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::net::SocketAddr;
use uuid::Uuid;

use bcp_authz::Role;

/// A static bearer token granting an actor context. The session
/// collaborator is external; the daemon only resolves tokens it was
/// configured with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub actor_id: Uuid,
    pub org_id: Uuid,
    pub role: Role,
    #[serde(default)]
    pub platform_admin: bool,
}

/// Typed daemon configuration, deserialized from the merged document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: SocketAddr,

    /// Scheduler tick safety net, seconds.
    #[serde(default = "defaults::tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Admission pass deadline, seconds.
    #[serde(default = "defaults::pass_deadline_secs")]
    pub pass_deadline_secs: u64,

    /// Fleet gateway base URL for dispatch notifications. `None` disables
    /// outbound delivery (useful for drills and local development).
    #[serde(default)]
    pub dispatch_base_url: Option<String>,

    /// Static bearer tokens accepted by the HTTP surface.
    #[serde(default)]
    pub tokens: Vec<StaticToken>,
}

mod defaults {
    use std::net::SocketAddr;

    pub fn bind_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 8740))
    }

    pub fn tick_interval_secs() -> u64 {
        5
    }

    pub fn pass_deadline_secs() -> u64 {
        5
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            tick_interval_secs: defaults::tick_interval_secs(),
            pass_deadline_secs: defaults::pass_deadline_secs(),
            dispatch_base_url: None,
            tokens: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Reject values that would wedge the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be > 0");
        }
        if self.pass_deadline_secs == 0 {
            bail!("pass_deadline_secs must be > 0");
        }
        if let Some(url) = &self.dispatch_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("dispatch_base_url must be an http(s) URL, got: {url}");
            }
        }
        Ok(())
    }
}

/// The merged, canonicalized, hashed configuration.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: DaemonConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Read each YAML layer in order, fold it over the previous ones, then
/// canonicalize, hash, and deserialize into the typed config.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut doc = Value::Object(serde_json::Map::new());
    for path in paths {
        merge_into(&mut doc, read_layer(path)?);
    }
    from_merged(doc)
}

fn read_layer(path: &str) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("config layer {path} is unreadable"))?;
    let parsed: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("config layer {path} is not valid YAML"))?;
    serde_json::to_value(parsed)
        .with_context(|| format!("config layer {path} does not map onto JSON"))
}

/// Build a `LoadedConfig` from an already-merged document. Exposed so
/// tests can exercise validation without touching the filesystem.
pub fn from_merged(merged: Value) -> Result<LoadedConfig> {
    let canonical = canonical_string(&merged);
    let hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    let config: DaemonConfig =
        serde_json::from_value(merged).context("config does not match the daemon schema")?;
    config.validate()?;

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Fold `overlay` into `base`. Tables combine key by key; anything else
/// (arrays included) is replaced whole by the later layer.
fn merge_into(base: &mut Value, overlay: Value) {
    if let Value::Object(fields) = overlay {
        if let Some(table) = base.as_object_mut() {
            for (key, value) in fields {
                match table.entry(key) {
                    serde_json::map::Entry::Occupied(mut slot) => {
                        merge_into(slot.get_mut(), value);
                    }
                    serde_json::map::Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
            return;
        }
        *base = Value::Object(fields);
    } else {
        *base = overlay;
    }
}

/// Compact JSON with every object's keys in lexicographic order, so the
/// hash depends only on the logical configuration.
fn canonical_string(doc: &Value) -> String {
    serde_json::to_string(&ordered(doc)).expect("canonical serialization cannot fail")
}

/// Rebuild the tree routing every object through a `BTreeMap`, which
/// hands the keys back sorted.
fn ordered(doc: &Value) -> Value {
    match doc {
        Value::Object(fields) => {
            let sorted: std::collections::BTreeMap<&String, &Value> = fields.iter().collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key.clone(), ordered(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(ordered).collect()),
        scalar => scalar.clone(),
    }
}
