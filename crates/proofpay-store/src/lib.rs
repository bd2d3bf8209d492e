//! ProofPay Store - persistence contract and cross-process coordination
//!
//! Everything ProofPay persists goes through [`RecordStore`], a small
//! list/filter/get/create/update contract implemented by:
//!
//! - [`HttpRecordStore`]: the remote store (online mode)
//! - [`FileStore`]: a local JSON file with identical semantics (offline mode)
//! - [`MemoryStore`]: in-process tables for tests and dry runs
//! - [`FailoverStore`]: online first, one-way switch to offline on network errors
//!
//! On top of the contract:
//!
//! - [`EntityRegistry`] and [`Collection<T>`]: typed access to registered entities
//! - [`FieldMapConfig`]: logical field to column renames, validated at startup
//! - [`create_idempotent`]: create-once by key, recovering from create races
//! - [`acquire_work_lease`]: exclusive, expiring leases keyed by work item
//!
//! # Race resolution
//!
//! The remote store offers no transactions. Duplicate creates are resolved
//! by creation order: the earliest live record for a key wins and losers are
//! marked `superseded_by`, which hides them from every collection query.

pub mod collection;
pub mod error;
pub mod failover;
pub mod field_map;
pub mod file;
pub mod http;
pub mod idempotent;
pub mod lease;
pub mod memory;
pub mod record;
pub mod registry;
pub mod store;

pub use collection::{Collection, Collections, Document};
pub use error::{Result, StoreError};
pub use failover::FailoverStore;
pub use field_map::{EntityFieldMap, FieldMapConfig};
pub use file::FileStore;
pub use http::HttpRecordStore;
pub use idempotent::{create_idempotent, CreateOutcome};
pub use lease::*;
pub use memory::MemoryStore;
pub use record::*;
pub use registry::*;
pub use store::RecordStore;
