pub mod alerts;
pub mod api_client;
pub mod auth;
pub mod config;
pub mod events;
pub mod reconcile;
pub mod socket;
pub mod types;
