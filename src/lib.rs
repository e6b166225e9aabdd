pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod sessions;
pub mod state;
