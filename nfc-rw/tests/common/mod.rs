// Shared fixtures for the integration test crates. Each aggregator pulls
// this in with `#[path = "common/mod.rs"]`, so not every helper is used by
// every crate.
#![allow(dead_code)]

pub mod fixtures;
pub mod helpers;
