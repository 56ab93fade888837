//! # Resilience Module
//!
//! Crash-loop protection for worker pools. The error-density limiter
//! watches the rate of worker failures and, past a configured density,
//! escalates into a single terminal signal that the top of the tree turns
//! into a process exit with the reserved code.
//!
//! ## Usage
//!
//! ```rust
//! use offload_core::config::LimiterOptions;
//! use offload_core::resilience::{ErrorDensityLimiter, FeedOutcome};
//!
//! let limiter = ErrorDensityLimiter::new(LimiterOptions {
//!     observation_period_ms: 5_000,
//!     registration_limit: 3,
//! });
//!
//! for _ in 0..3 {
//!     assert!(matches!(limiter.feed(), FeedOutcome::Recorded { .. }));
//! }
//! assert!(matches!(limiter.feed(), FeedOutcome::Tripped));
//! assert!(limiter.is_tripped());
//! ```

pub mod error_limiter;

pub use error_limiter::{ErrorDensityLimiter, FeedOutcome};
