pub mod types;
pub mod decimal;
pub mod database;
pub mod config;
pub mod error;
pub mod cancel;
pub mod stats;
