//! Concrete job implementations.

pub mod ranking;

pub use ranking::{RankingJob, RANKING_JOB_NAME};
