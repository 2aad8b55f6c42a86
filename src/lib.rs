pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod exchange;
pub mod ingest;
pub mod market;
pub mod model;
pub mod utils;
