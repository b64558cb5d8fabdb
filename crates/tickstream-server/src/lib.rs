//! Library surface behind the `tickstream-server` binary, split out so
//! full-stack scenario tests in `tests/` can drive the real accept loop
//! over a loopback socket instead of re-implementing it.

pub mod admission;
pub mod app;
pub mod config;
pub mod core;
pub mod metrics;
