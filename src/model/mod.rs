//! Core data types for catalog records and scan lifecycles.
//!
//! This module contains the fundamental types used throughout imagescan:
//!
//! - [`ToolRecord`] - A catalog entry whose security fields this crate maintains
//! - [`Security`] - The security block of a record (status, scan date, counts)
//! - [`ResolvedImage`] - An image reference chosen for one scan attempt
//! - [`ScanAttempt`] - The raw outcome of one scanner process invocation
//! - [`ErrorKind`] / [`ErrorTier`] - Failure taxonomy driving retry and caching
//! - [`ScanResult`] - Terminal outcome of one tool's scan lifecycle
//! - [`BatchResult`] - Aggregate outcome of a batch
//!
//! # Example
//!
//! ```
//! use imagescan::model::{SecurityStatus, ToolRecord};
//!
//! let tool = ToolRecord::new("docker_hub:library/postgres")
//!     .with_tags(vec!["16-bullseye".into(), "stable".into()]);
//!
//! assert_eq!(tool.security.status, SecurityStatus::Unknown);
//! ```

mod scan;
mod tool;

pub use scan::*;
pub use tool::*;
