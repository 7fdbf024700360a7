//! dagrun - Trigger-rule DAG execution core with branch, join and sensor nodes

pub mod action;
pub mod archive;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod retry;
pub mod runner;
pub mod sensor;
pub mod store;
pub mod trigger;
