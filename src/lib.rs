// Library crate for integration tests and the binary.

pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod generator;
pub mod lease;
pub mod orchestrator;
pub mod queue;
pub mod results;
pub mod routes;
pub mod runner;
pub mod server;
pub mod settings;
pub mod state;
pub mod stop;
pub mod test_run;
pub mod validation;
pub mod values;
