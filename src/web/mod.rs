//! The web module for handling the Axum API.

pub mod api;
pub mod controller_channel;
pub mod models;
