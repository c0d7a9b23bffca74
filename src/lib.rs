//! Virtual-user runtime for scripted HTTP load generation.
//!
//! A [`Runner`] holds one JavaScript test script and produces [`Vu`]s. Each VU
//! owns an isolated QuickJS context, an HTTP client and a cookie jar, and runs
//! the script once per call to [`Vu::run_once`]. Scripts talk to the host
//! through `$http`, `$vu`, `$test` and `$log`; every request and iteration is
//! reported as a [`Metric`] on the runner's stats channel.

mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

#[cfg(test)]
mod test_server;

pub use config::RuntimeConfig;
pub use engine::{EnvSource, ProcessEnv, Runner, Vu};
pub use error::{HttpError, VuError};
pub use stats::Metric;
pub use utils::parse_duration_str;
