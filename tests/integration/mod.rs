//! Integration test suite for jobflow.
//!
//! These tests submit jobs to a scheduler and play the part of the
//! execution workers, reporting outcomes the way a real worker would.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Jobs using IF, LOOP and REPLICATE end to end
//! - `recovery`: On-task-error policies, restarts and node loss
//! - `persistence`: Snapshots, journal replay and configuration files

mod fixtures;

mod persistence;
mod recovery;
mod workflow_e2e;
