//! Optional host-owned cache of current state
//!
//! Keeps identity-keyed snapshots in `state-cache.json` under a host-chosen
//! directory. Entries older than the TTL are ignored. The core only touches a
//! cache that a host explicitly attaches to the [`Reconciler`].
//!
//! [`Reconciler`]: crate::reconciler::Reconciler

use crate::error::{ReconcileError, Result};
use crate::identity::{ResourceIdentity, ResourceKind};
use crate::tree::AttributeTree;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const CACHE_VERSION: u32 = 1;
const CACHE_FILE: &str = "state-cache.json";
const CACHE_BACKUP: &str = "state-cache.json.backup";
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

pub trait StateCache {
    fn get(&self, identity: &ResourceIdentity) -> Result<Option<AttributeTree>>;
    fn put(&self, identity: &ResourceIdentity, state: &AttributeTree) -> Result<()>;
    fn evict(&self, identity: &ResourceIdentity) -> Result<()>;
}

/// On-disk cache document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDocument {
    pub version: u32,
    pub updated_at: DateTime<Utc>,

    /// Snapshots indexed by identity cache key
    pub entries: BTreeMap<String, CachedState>,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            updated_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedState {
    pub kind: ResourceKind,
    pub attributes: AttributeTree,
    pub fetched_at: DateTime<Utc>,
}

/// JSON-file backed [`StateCache`]
pub struct FileStateCache {
    dir: PathBuf,
    ttl: Duration,
}

impl FileStateCache {
    pub fn new(dir: impl AsRef<Path>, ttl_secs: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
        }
    }

    fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(CACHE_BACKUP)
    }

    pub fn load(&self) -> Result<CacheDocument> {
        let path = self.cache_path();
        if !path.exists() {
            tracing::debug!("State cache not found, starting empty");
            return Ok(CacheDocument::default());
        }

        let content = fs::read_to_string(&path)?;
        let doc: CacheDocument = serde_json::from_str(&content).map_err(|e| {
            ReconcileError::configuration(format!("corrupt state cache {}: {}", path.display(), e))
        })?;

        if doc.version > CACHE_VERSION {
            return Err(ReconcileError::configuration(format!(
                "State cache version {} is newer than supported version {}",
                doc.version, CACHE_VERSION
            )));
        }
        Ok(doc)
    }

    pub fn save(&self, doc: &CacheDocument) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.cache_path();
        if path.exists() {
            fs::rename(&path, self.backup_path())?;
        }

        let content = serde_json::to_string_pretty(doc).map_err(std::io::Error::other)?;
        fs::write(&path, content)?;
        tracing::debug!("Saved state cache with {} entries", doc.entries.len());
        Ok(())
    }

    fn is_fresh(&self, entry: &CachedState) -> bool {
        Utc::now().signed_duration_since(entry.fetched_at) < self.ttl
    }
}

impl StateCache for FileStateCache {
    fn get(&self, identity: &ResourceIdentity) -> Result<Option<AttributeTree>> {
        let doc = self.load()?;
        Ok(doc
            .entries
            .get(&identity.cache_key())
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.attributes.clone()))
    }

    fn put(&self, identity: &ResourceIdentity, state: &AttributeTree) -> Result<()> {
        let mut doc = self.load()?;
        let now = Utc::now();
        doc.entries.insert(
            identity.cache_key(),
            CachedState {
                kind: identity.kind,
                attributes: state.clone(),
                fetched_at: now,
            },
        );
        doc.updated_at = now;
        self.save(&doc)
    }

    fn evict(&self, identity: &ResourceIdentity) -> Result<()> {
        let mut doc = self.load()?;
        if doc.entries.remove(&identity.cache_key()).is_some() {
            doc.updated_at = Utc::now();
            self.save(&doc)?;
        }
        Ok(())
    }
}
