pub mod bucket;
pub mod budget;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod gateway_util;
pub mod idempotency;
pub mod instance;
pub mod observability;
pub mod pipeline;
pub mod router;
pub mod routes;
pub mod settings;
pub mod strategy;
pub mod tokens;
