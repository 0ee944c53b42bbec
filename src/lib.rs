// Core modules
pub mod config;
pub mod dashboard;
pub mod db;
pub mod engine;
pub mod execution;
pub mod indicators;
pub mod ingestion;
pub mod models;
pub mod notifications;
pub mod strategy;

// Re-export commonly used types
pub use models::*;
