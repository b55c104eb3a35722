//! End-to-end tests for the evidence engine and its binaries.

mod cli;
mod common;
mod guard_failures;
mod inbox_cascade;
mod reconcile;
mod upload_lifecycle;
