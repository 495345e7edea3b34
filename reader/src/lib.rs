//! Call-tree reconstruction and statistics over decoded captures.
//!
//! [`build_report`] turns a flat [`profile_format::CaptureDump`] into
//! per-thread nested trees with per-parent/per-frame/per-thread call
//! statistics. [`BackgroundLoader`] runs the same pipeline on a worker
//! thread with progress reporting and cooperative cancellation.

use thiserror::Error;

pub mod load;
pub mod stats;
pub mod tree;

pub use load::BackgroundLoader;
pub use stats::{Anchor, BlockStatistics, StatisticsAggregator, StatsScope};
pub use tree::{build_report, build_report_with, ProfileReport, ThreadContext, TreeNode};

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("format error: {0}")]
    Format(#[from] profile_format::FormatError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("load interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, ReaderError>;
