//! # praxis-collab — collaborative notebook synchronization engine
//!
//! Real-time multi-user editing for notebooks (a title plus an ordered
//! sequence of code/markdown cells) using CRDT synchronization.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    WebSocket     ┌──────────────┐
//! │ NotebookSession │ ◄──────────────► │   Gateway    │
//! │  (per client)   │   binary frames  │ (stateless)  │
//! └───────┬─────────┘                  └──────┬───────┘
//!         │                                   │ notebookId
//!         ▼                                   ▼
//! ┌─────────────────┐                 ┌──────────────┐
//! │ Yrs Doc (local) │                 │ Coordinator  │  one per
//! │ + awareness     │                 │ (actor task) │  notebook
//! └─────────────────┘                 └──────┬───────┘
//!                                            │ coalesced alarm
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │ SnapshotStore│
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — varint-framed sync/awareness wire codec over yrs
//! - [`awareness`] — ephemeral presence registry
//! - [`document`] — notebook document model + sanitization
//! - [`storage`] — durable snapshot store
//! - [`coordinator`] — per-notebook authority actor and registry
//! - [`gateway`] — HTTP/WebSocket front door with token auth
//! - [`session`] — client session: bootstrap, provider, runtime state
//! - [`kernel`] / [`blobstore`] — clients for the external services
//!
//! The CRDT merge semantics are entirely [`yrs`]'s; this crate only frames,
//! routes, persists and sanitizes.

pub mod awareness;
pub mod blobstore;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod gateway;
pub mod kernel;
pub mod protocol;
pub mod session;
pub mod storage;

pub use awareness::{Awareness, AwarenessEvent, AwarenessUpdate, ClientId};
pub use blobstore::{BlobStoreClient, LocalBackup, StoredCell, StoredNotebook};
pub use config::{KernelMode, SessionConfig};
pub use coordinator::{CoordinatorHandle, CoordinatorStats, Registry};
pub use document::{CellData, CellType, NotebookDoc};
pub use gateway::{GatewayConfig, GatewayState};
pub use kernel::{CellOutput, KernelClient, KernelStatus, OutputType, Variable};
pub use protocol::{Message, ProtocolError, SyncMessage};
pub use session::{CellView, CollabStatus, NotebookSession, RunStatus, SessionEvent};
pub use storage::{SnapshotStore, StoreConfig, StoreError};
