//! Integration tests for the Stratus scheduler.
//!
//! These suites exercise the scheduler facade end to end over the in-memory
//! store backends and recording transport doubles, covering the full
//! validation round lifecycle, the replication state machine, and the
//! idempotence laws of the public operations.

pub mod mock_infrastructure;

#[cfg(test)]
mod election_tests;
#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod replication_tests;
#[cfg(test)]
mod validation_tests;
