//! Runtime primitives
//!
//! Small building blocks the hub and the sync engine share:
//!
//! - **`clock`** - Injectable wall clock (`SystemClock` in production,
//!   `ManualClock` in tests), monotonic id source and random jitter
//! - **`locks`** - Keyed mutex map with idle-entry eviction, used for the
//!   per-user sync lock and per-user notification ordering

pub mod clock;
pub mod locks;

pub use clock::{jitter, Clock, IdSource, ManualClock, SharedClock, SystemClock};
pub use locks::{KeyedGuard, KeyedLocks};
