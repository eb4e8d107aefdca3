//! Typed read/write facades over the shared cache.
//!
//! All writes and reads go through the memoize cache so repeat reads of
//! identical payloads skip decoding.

pub mod auth;
pub mod flag;
pub mod inventory;
pub mod keys;
pub mod segment;
pub mod target;

pub use auth::{AuthRepo, KeyListOp};
pub use flag::FlagRepo;
pub use inventory::{CleanupResult, InventoryRepo};
pub use segment::SegmentRepo;
pub use target::TargetRepo;
