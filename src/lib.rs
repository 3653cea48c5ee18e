//! Lazy, exactly-once-in-flight loading and soft caching for the large
//! decoded images of a memory-constrained viewer.
//!
//! A decoded medical or scientific image is often ten times the size of its
//! file, the native decoder below it must never run twice concurrently, and
//! a viewer holding dozens of such images cannot keep them all in memory.
//! This crate provides the resource-management core for that situation via
//! a few cooperating pieces:
//!
//! [SoftCache] holds decoded values that may be reclaimed at any moment:
//! when the total resident bytes exceed a configured budget the oldest
//! entries are evicted, and every eviction is routed through a single
//! cleanup point that lets the owning resource close its reader.  A reverse
//! index from reference identity to key makes that cleanup possible even
//! though the eviction routine only knows which reference died.
//!
//! [DecodeScheduler] serializes all decode work through one dedicated
//! worker thread, process-wide, because the decode path is not reentrant.
//!
//! [ImageResource] ties the two together for one image: lazy single-flight
//! loading, sticky unreadable state after a terminal decode failure,
//! memoized min/max pixel statistics, calibration metadata, and a bounded
//! compact-and-retry pass when a decode fails with an allocation error.
//!
//! To use this crate, implement [MediaReader] for your decoder (or use the
//! file-backed [FileMediaReader]), build a shared [SoftCache] and a
//! [DecodeScheduler] (or [DecodeScheduler::global]), and create one
//! [ImageResource] per loadable image.
mod decoded;
mod file_reader;
mod load_task;
mod resource;
mod scheduler;
mod soft_cache;
mod traits;

pub use decoded::*;
pub use file_reader::*;
pub use resource::*;
pub use scheduler::*;
pub use soft_cache::*;
pub use traits::*;
