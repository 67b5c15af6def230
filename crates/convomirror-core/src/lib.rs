//! Incremental synchronization engine for mirroring a remote conversation
//! archive onto local storage.
//!
//! The engine keeps a local mirror eventually consistent with a remote,
//! paginated collection of conversations while avoiding duplicate work
//! across concurrently running client instances:
//!
//! - **Leader election** ([`locks`], [`service`]): exactly one instance
//!   runs the periodic loop; the rest stand by and poll.
//! - **Change detection** ([`scanner`]): pagination plus watermark
//!   comparison, with an early exit once a page is fully clean.
//! - **Fetching** ([`scheduler`]): bounded fan-out with retry, backoff
//!   and a fail-fast batch policy.
//! - **Persistence** ([`writer`], [`attachments`]): idempotent, resumable
//!   writes of conversation bodies and their binary attachments.
//! - **Bookkeeping** ([`state`]): a durable JSON document of per-entity
//!   watermarks, mutated only inside a named critical section.
//!
//! The remote API, the local store and the credential source are consumed
//! through the traits in [`remote`] and [`store`]; `convomirror-api`
//! provides the HTTP implementations.

pub mod attachments;
pub mod config;
pub mod cycle;
pub mod error;
pub mod locks;
pub mod remote;
pub mod scanner;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod status;
pub mod store;
pub mod types;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::SyncConfig;
pub use cycle::{CycleOutcome, Orchestrator};
pub use error::{Result, SyncError};
pub use locks::{NamedLocks, LEADER_LOCK, STATE_LOCK};
pub use remote::{AttachmentPayload, CredentialProvider, RemoteApi};
pub use scheduler::CancelFlag;
pub use service::SyncService;
pub use state::{EntityRecord, ScopeState, SyncState};
pub use status::{StatusPublisher, SyncPhase, SyncRole, SyncStatus};
pub use store::{FsStore, LocalStore, MemoryStore};
pub use types::Identity;
