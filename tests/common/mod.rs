//! Common test infrastructure
//!
//! Integration tests run several schedulers, lease holders and ranking replicas
//! against the same SQLite files, the way separate processes would share them.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{fast_scheduler_settings, TestEnv};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnv::new();
//!     let store = env.open_job_store();
//!     // ...
//! }
//! ```

mod constants;
mod fixtures;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{fast_scheduler_settings, wait_until, TestEnv};
