pub mod api;
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod daemon;
pub mod health;
pub mod model;
pub mod query;
pub mod store;
pub mod tasks;
