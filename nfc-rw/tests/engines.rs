// Aggregator for tag engine integration tests in `tests/engines/`.
// Every scenario runs an engine against a simulated tag through the mock
// transport, without a session on top.

#[path = "common/mod.rs"]
mod common;

#[path = "engines/type1_test.rs"]
mod type1_test;

#[path = "engines/type2_test.rs"]
mod type2_test;

#[path = "engines/iso15693_test.rs"]
mod iso15693_test;
