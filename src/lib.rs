#![forbid(unsafe_code)]

pub mod archive;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod harvest;
pub mod logging;
pub mod manager;
pub mod orchestrator;
pub mod pool;
pub mod segment;
pub mod sink;
