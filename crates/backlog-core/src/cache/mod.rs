//! Resume cache: output + input manifest per unit of work.
//!
//! A unit (miner job, merge pair, labeler variant) owns two keys in a
//! [`ResultStore`]: its output and the manifest describing the inputs that
//! produced it. Output is reused only when the stored manifest equals the
//! freshly computed one field for field.
//!
//! Write order is output first, manifest second. A crash between the two
//! leaves an output without a manifest. Such legacy outputs are reused with
//! a warning and a backfilled manifest, and reported as `legacy`, never
//! `verified`. The merge judge and `--strict-cache` runs treat them as a
//! miss.

pub mod fs;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::METRICS;

/// Errors from the result store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Key-value store for cached unit outputs and manifests.
///
/// Guarantees:
/// - `read` of a key never written returns `Ok(None)`.
/// - `read` of an unreadable or undecodable entry returns `Err(Corrupt)`.
/// - `write` is atomic: readers see the old value or the new one.
pub trait ResultStore: Send + Sync {
    fn read(&self, key: &str) -> CacheResult<Option<Value>>;

    fn write(&self, key: &str, value: &Value) -> CacheResult<()>;
}

/// Where one unit keeps its output and manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    pub output_key: String,
    pub manifest_key: String,
}

impl CacheSlot {
    pub fn new(output_key: impl Into<String>, manifest_key: impl Into<String>) -> Self {
        Self {
            output_key: output_key.into(),
            manifest_key: manifest_key.into(),
        }
    }
}

/// How a unit's output was obtained, as recorded in metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    #[default]
    Miss,
    Verified,
    Legacy,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "miss",
            CacheStatus::Verified => "verified",
            CacheStatus::Legacy => "legacy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupOptions {
    pub resume: bool,
    pub force: bool,
    /// Accept an output that has no manifest at all.
    pub allow_legacy: bool,
}

/// A usable cached output.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheHit {
    Verified(Value),
    Legacy(Value),
}

impl CacheHit {
    pub fn status(&self) -> CacheStatus {
        match self {
            CacheHit::Verified(_) => CacheStatus::Verified,
            CacheHit::Legacy(_) => CacheStatus::Legacy,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            CacheHit::Verified(v) | CacheHit::Legacy(v) => v,
        }
    }
}

/// Log a cached artifact that exists but cannot be used.
pub fn report_corruption(key: &str, reason: &str) {
    warn!(code = "cache_corruption", key = %key, reason = %reason, "ignoring unusable cached artifact");
}

/// Look up a unit's cached output.
///
/// Returns `None` (a miss) when resume is off, `force` is set, nothing is
/// stored, the manifest differs, or an entry is corrupt. A missing
/// manifest yields [`CacheHit::Legacy`] only with `allow_legacy`.
pub fn lookup(
    store: &dyn ResultStore,
    slot: &CacheSlot,
    expected: &Value,
    options: LookupOptions,
) -> Option<CacheHit> {
    if !options.resume || options.force {
        return None;
    }

    let output = match store.read(&slot.output_key) {
        Ok(Some(output)) => output,
        Ok(None) => {
            METRICS.inc_cache_misses();
            return None;
        }
        Err(e) => {
            report_corruption(&slot.output_key, &e.to_string());
            METRICS.inc_cache_misses();
            return None;
        }
    };

    match store.read(&slot.manifest_key) {
        Ok(Some(stored)) if stored == *expected => {
            METRICS.inc_cache_hits();
            Some(CacheHit::Verified(output))
        }
        Ok(Some(_)) => {
            debug!(key = %slot.manifest_key, "input manifest changed; recomputing");
            METRICS.inc_cache_misses();
            None
        }
        Ok(None) if options.allow_legacy => {
            warn!(
                code = "legacy_cache_accepted",
                key = %slot.output_key,
                "accepting cached output without an input manifest; manifest will be backfilled"
            );
            METRICS.inc_legacy_cache_hits();
            Some(CacheHit::Legacy(output))
        }
        Ok(None) => {
            debug!(key = %slot.output_key, "cached output has no input manifest; recomputing");
            METRICS.inc_cache_misses();
            None
        }
        Err(e) => {
            report_corruption(&slot.manifest_key, &e.to_string());
            METRICS.inc_cache_misses();
            None
        }
    }
}

/// Persist a validated output, then its manifest.
pub fn commit(
    store: &dyn ResultStore,
    slot: &CacheSlot,
    output: &Value,
    manifest: &Value,
) -> CacheResult<()> {
    store.write(&slot.output_key, output)?;
    store.write(&slot.manifest_key, manifest)
}

/// Write the manifest for a legacy output that was just accepted.
pub fn backfill(store: &dyn ResultStore, slot: &CacheSlot, manifest: &Value) -> CacheResult<()> {
    store.write(&slot.manifest_key, manifest)
}
