//! # chronolog-store: per-user time-series record store
//!
//! In-memory, per-collection stores of timestamped opaque payloads with
//! incremental snapshots to a directory tree.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  resolve(name)   ┌───────────────────────┐
//! │ CollectionRouter │ ───────────────► │ Store (per collection) │
//! │ patterns + TTLs  │                  │ uid → UserLog          │
//! └──────────────────┘                  └───────────┬───────────┘
//!                                                   │ flush / load
//!                                                   ▼
//!                                       ┌───────────────────────┐
//!                                       │ SnapshotDir            │
//!                                       │ <root>/<coll>/<uid>/   │
//!                                       │   <unix-ts>.json       │
//!                                       └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`record`]: `Record` and the sorted, dirty-tracked `UserLog`
//! - [`store`]: one collection's uid map behind a single RwLock
//! - [`snapshot`]: fragment write, directory-walk load, user removal
//! - [`router`]: `name:ttl` / `prefix.*:ttl` patterns, lazy store creation
//! - [`clock`]: wall-clock seam (system and manual)
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod clock;
pub mod error;
pub mod record;
pub mod router;
pub mod snapshot;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{validate_key, StoreError};
pub use record::{Record, UserLog};
pub use router::{CollectionPattern, CollectionRouter, PatternKind, RouterConfig};
pub use snapshot::{LoadStats, SnapshotDir};
pub use store::{FlushReport, Store};
