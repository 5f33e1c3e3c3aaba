//! Epoxy core primitives
//!
//! Dependency-light building blocks shared by the gateway:
//!
//! - [`GenerationalCache`]: a two-generation string cache that bounds entry
//!   lifetime to one or two swap intervals without per-key timers.
//! - [`claims::lookup_str`]: dot-path lookup into decoded token claims.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod claims;

pub use cache::{CacheStatsSnapshot, GenerationalCache};
