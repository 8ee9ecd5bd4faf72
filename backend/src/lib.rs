pub mod config;
pub mod error;
pub mod inference;
pub mod loader;
pub mod models;
pub mod routes;
pub mod service;
