//! Integration tests module
//!
//! End-to-end tests for the herald dispatch engine, including:
//! - Send → fan-out → finalize against a real SQLite file
//! - Partial failure, deadlines and stale leases
//! - Draft lifecycle and recipient inbox

pub mod crud_test;
pub mod dispatch_test;
pub mod error_scenarios;
