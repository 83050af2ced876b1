//! Ephemeral key/value store shared by the quota tracker and response cache.
//!
//! ## Modes
//!
//! - **Local (DashMap)**: per-instance, used when Redis is disabled or unreachable at startup
//! - **Redis**: shared across instances
//!
//! Both modes expose the same primitives: atomic increment-with-expiry, get/set
//! with TTL, and incremental pattern enumeration and deletion. Pattern
//! operations never block the store: Redis is walked with `SCAN`, never `KEYS`.

pub mod backend;
pub mod local;
pub mod pattern;

pub use backend::{EphemeralStore, StoreError};
pub use local::LocalStore;
pub use pattern::escape_glob;
