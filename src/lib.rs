pub mod analysis;
pub mod api;
pub mod classify;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod sherlock;
pub mod storage;
