pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod rate_limit;
pub mod response;
pub mod routes;
pub mod schema;
pub mod state;
pub mod types;
pub mod utils;
