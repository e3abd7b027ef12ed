//! Collection routing: registered patterns to lazily created stores.
//!
//! ```text
//!  "events.login" ──► stores["events.login"]?  ── hit ──► Arc<Store>
//!                          │ miss
//!                          ▼
//!                 patterns: public:60, events.*:1
//!                          │ events.* matches
//!                          ▼
//!                 Store::open("events.login", 1 min)  (loads from disk)
//! ```
//!
//! Exactly one store exists per collection name; it owns
//! `<root>/<collection>/` on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{validate_key, StoreError};
use crate::snapshot::SnapshotDir;
use crate::store::Store;

/// How a pattern matches collection names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternKind {
    /// `name` matches only `name`
    Exact(String),
    /// `prefix.*` matches `prefix.X` where `X` is a single non-empty segment
    Prefix(String),
}

/// A registered collection pattern with its retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPattern {
    kind: PatternKind,
    ttl: Duration,
}

impl CollectionPattern {
    pub fn exact(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kind: PatternKind::Exact(name.into()),
            ttl,
        }
    }

    pub fn prefix(prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kind: PatternKind::Prefix(prefix.into()),
            ttl,
        }
    }

    pub fn kind(&self) -> &PatternKind {
        &self.kind
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn matches(&self, collection: &str) -> bool {
        match &self.kind {
            PatternKind::Exact(name) => collection == name,
            PatternKind::Prefix(prefix) => match collection.split_once('.') {
                Some((head, token)) => head == prefix && !token.is_empty() && !token.contains('.'),
                None => false,
            },
        }
    }
}

impl std::fmt::Display for CollectionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let minutes = self.ttl.as_secs() / 60;
        match &self.kind {
            PatternKind::Exact(name) => write!(f, "{name}:{minutes}"),
            PatternKind::Prefix(prefix) => write!(f, "{prefix}.*:{minutes}"),
        }
    }
}

/// Parses `name:ttl_minutes` or `prefix.*:ttl_minutes`.
impl FromStr for CollectionPattern {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidPattern(s.to_string());

        let (name, ttl) = s.split_once(':').ok_or_else(invalid)?;
        let minutes: u64 = ttl.parse().map_err(|_| invalid())?;
        let ttl = minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(invalid)?;

        if name.matches('.').count() > 1 {
            return Err(invalid());
        }
        let kind = match name.strip_suffix(".*") {
            Some(prefix) => PatternKind::Prefix(prefix.to_string()),
            None => PatternKind::Exact(name.to_string()),
        };
        let base = match &kind {
            PatternKind::Exact(n) | PatternKind::Prefix(n) => n,
        };
        if base.contains('*') || validate_key(base).is_err() {
            return Err(invalid());
        }
        Ok(Self { kind, ttl })
    }
}

/// Static router settings.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Persistence root (None = in-memory only)
    pub storage_root: Option<PathBuf>,
    pub patterns: Vec<CollectionPattern>,
}

/// Resolves collection names to their stores.
pub struct CollectionRouter {
    patterns: Vec<CollectionPattern>,
    snapshots: Option<SnapshotDir>,
    stores: RwLock<HashMap<String, Arc<Store>>>,
    clock: Arc<dyn Clock>,
}

impl CollectionRouter {
    /// Create a router with no stores yet.
    pub fn new(config: RouterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: config.patterns,
            snapshots: config.storage_root.map(SnapshotDir::new),
            stores: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Create a router and load every on-disk collection that matches a pattern.
    pub fn open(config: RouterConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let router = Self::new(config, clock);
        router.open_existing()?;
        Ok(router)
    }

    fn open_existing(&self) -> Result<usize, StoreError> {
        let Some(dir) = &self.snapshots else {
            log::info!("No storage directory set, data will not be stored on disk");
            return Ok(0);
        };
        dir.ensure_root()?;

        let mut opened = 0;
        for name in dir.list_collections()? {
            if self.pattern_for(&name).is_none() || validate_key(&name).is_err() {
                log::warn!("Ignoring unregistered collection directory {name}");
                continue;
            }
            self.resolve(&name)?;
            opened += 1;
        }
        log::info!("Opened {opened} collections from {}", dir.root().display());
        Ok(opened)
    }

    pub fn patterns(&self) -> &[CollectionPattern] {
        &self.patterns
    }

    pub fn is_persistent(&self) -> bool {
        self.snapshots.is_some()
    }

    /// First registered pattern matching `collection`.
    pub fn pattern_for(&self, collection: &str) -> Option<&CollectionPattern> {
        self.patterns.iter().find(|p| p.matches(collection))
    }

    /// Existing store for `collection`, without creating one.
    pub fn get(&self, collection: &str) -> Option<Arc<Store>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
    }

    /// Store for `collection`, created on first use if a pattern matches.
    pub fn resolve(&self, collection: &str) -> Result<Arc<Store>, StoreError> {
        if let Some(store) = self.get(collection) {
            return Ok(store);
        }

        let ttl = self
            .pattern_for(collection)
            .map(CollectionPattern::ttl)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        validate_key(collection)?;

        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        // Double-check after acquiring write lock
        if let Some(store) = stores.get(collection) {
            return Ok(store.clone());
        }
        let store = Arc::new(Store::open(
            collection,
            ttl,
            self.snapshots.clone(),
            self.clock.clone(),
        )?);
        stores.insert(collection.to_string(), store.clone());
        log::info!("Opened collection {collection} (ttl {}s)", ttl.as_secs());
        Ok(store)
    }

    /// Every instantiated store, ordered by name.
    pub fn stores(&self) -> Vec<Arc<Store>> {
        let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<Arc<Store>> = stores.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    pub fn collection_count(&self) -> usize {
        self.stores.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
