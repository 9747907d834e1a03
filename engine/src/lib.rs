//! # Cellar Engine
//!
//! An in-memory, reactive store of tables and keyed values, with a
//! mergeable variant for multi-writer sync.
//!
//! This crate provides the core logic that persisters and synchronizers sit
//! on. It owns no files, sockets or threads: everything runs synchronously
//! on the calling thread, and listeners are called from within the call
//! that changed the data.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic merge**: Replicas that have seen the same changes hold
//!   the same content, whatever order the changes arrived in
//! - **Fine-grained reactivity**: Listeners subscribe to exactly the paths
//!   they care about and are called once per transaction
//!
//! ## Core Concepts
//!
//! ### Content
//!
//! A store holds **tables** (table id → row id → cell id → [`Cell`]) and
//! **values** (value id → [`Value`]). Cells are strings, finite numbers or
//! booleans. Empty rows and tables do not exist: removing the last cell of
//! a row removes the row, and so on up.
//!
//! ### Transactions
//!
//! Every write runs in a transaction. Nested transactions collapse into the
//! outermost one, and listeners are called once it finishes, with access to
//! the net change for their path. See [`Store::transaction`].
//!
//! ### Schemas
//!
//! An optional [`TablesSchema`] and [`ValuesSchema`] constrain types and
//! supply defaults. Invalid writes are dropped and reported to invalid
//! listeners rather than returned as errors.
//!
//! ### Mergeable stores
//!
//! A [`MergeableStore`] stamps every cell and value with a hybrid logical
//! clock time and keeps an order-independent hash tree over the stamps.
//! Two replicas converge by exchanging stamps, newest time winning, and can
//! find what differs by comparing hashes level by level.
//!
//! ### Derived components
//!
//! [`Metrics`], [`Indexes`], [`Relationships`], [`Queries`] and
//! [`Checkpoints`] are built on a store's listener API and keep their own
//! caches in step with it.
//!
//! ## Quick Start
//!
//! ```rust
//! use cellar_engine::{MergeableStore, Store, StoreConfig};
//!
//! let store = Store::new();
//! store
//!     .set_cell("pets", "fido", "species", "dog")
//!     .set_value("open", true);
//! assert_eq!(store.get_json(), r#"[{"pets":{"fido":{"species":"dog"}}},{"open":true}]"#);
//!
//! let a = MergeableStore::with_config(StoreConfig::default().with_unique_id("a"));
//! let b = MergeableStore::with_config(StoreConfig::default().with_unique_id("b"));
//! a.set_cell("pets", "fido", "sold", false);
//! b.set_cell("pets", "felix", "sold", true);
//! a.merge(&b);
//! assert_eq!(a.get_content(), b.get_content());
//! ```
//!
//! ## FFI
//!
//! The [`ffi`] module provides C-compatible functions for persisters
//! written in other languages. All data is exchanged as JSON strings.

pub mod cell;
pub mod changes;
pub mod checkpoints;
pub mod clock;
pub mod config;
mod derived;
pub mod error;
pub mod ffi;
pub mod hash;
pub mod indexes;
pub mod listeners;
pub mod mergeable;
pub mod metrics;
pub mod queries;
pub mod relationships;
pub mod schema;
pub mod stamp;
mod state;
pub mod store;
pub mod sync;

// Re-export main types at crate root
pub use cell::{Cell, CellType, CellWrite, Value, ValueWrite};
pub use changes::{
    CellChange, ChangedIds, Changes, Content, GetCellChange, GetValueChange, TransactionLog,
};
pub use checkpoints::Checkpoints;
pub use clock::HlcClock;
pub use config::StoreConfig;
pub use error::Error;
pub use indexes::{IndexDefinition, Indexes};
pub use listeners::ListenerStats;
pub use mergeable::MergeableStore;
pub use metrics::{Aggregate, MetricDefinition, Metrics};
pub use queries::{Queries, QueryDefinition};
pub use relationships::{Relationships, RelationshipDefinition};
pub use schema::{CellSchema, TableSchema, TablesSchema, ValueSchema, ValuesSchema};
pub use stamp::{ContentHashes, MergeableChanges, MergeableContent};
pub use store::Store;
pub use sync::{pull, respond, Message};

use std::collections::BTreeMap;

/// Type aliases for clarity
pub type Id = String;
pub type Ids = Vec<Id>;
pub type Row = BTreeMap<Id, Cell>;
pub type Table = BTreeMap<Id, Row>;
pub type Tables = BTreeMap<Id, Table>;
pub type Values = BTreeMap<Id, Value>;
pub type ListenerId = u64;
pub type Hash = u32;
pub type Time = String;
