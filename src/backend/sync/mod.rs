//! Offline Sync Module
//!
//! Accepts mutations from intermittently connected clients, applies them
//! to server records with retry and backoff, detects conflicts against
//! record versions and resolves them under a configurable strategy.
//!
//! # Module Structure
//!
//! ```text
//! sync/
//! ├── mod.rs          - Module exports and documentation
//! ├── backoff.rs      - Exponential backoff with jitter
//! ├── queue.rs        - `OperationQueue` (enqueue, claim, finish)
//! ├── merge.rs        - `StructuralMerge` and `JsonMerge`
//! ├── resolver.rs     - `ConflictResolver` (detection and strategies)
//! ├── controller.rs   - `SyncController` (per-user drain, sync token)
//! ├── retry_loop.rs   - Background sweeper
//! └── handlers.rs     - `/sync/*` endpoints
//! ```
//!
//! # Consistency
//!
//! Writes to one record are serialised by a compare-and-set on its
//! version. Only one drain per user runs at a time; a second caller gets
//! `Busy`. Within a drain, ops are applied in enqueue order.

pub mod backoff;
pub mod controller;
pub mod handlers;
pub mod merge;
pub mod queue;
pub mod resolver;
pub mod retry_loop;

pub use backoff::Backoff;
pub use controller::{SyncController, SyncMode, SyncReport, CONFLICT_PENDING_KIND};
pub use merge::{JsonMerge, MergeOutcome, StructuralMerge};
pub use queue::{Finished, OperationQueue, Outcome};
pub use resolver::{ConflictResolver, Decision, Effect, Resolution, Settlement};
pub use retry_loop::{RetryLoop, SweepReport};
