//! Integration test entry point for archivist-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod protocol;
mod replication;
