//! Parking gateway library
//!
//! Shared by the coordinator, floor controller and simulator binaries, and
//! exposed for integration testing.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
