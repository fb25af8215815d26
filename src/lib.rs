//! Defect Scan
//!
//! Asynchronous visual defect analysis: uploaded images and videos are queued,
//! scored by a fixed heuristic (sharpness, edge density, red-dominant color
//! ratio) in worker processes, and their verdicts retrieved by job id.

pub mod app;
pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
