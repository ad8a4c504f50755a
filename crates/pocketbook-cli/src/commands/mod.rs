//! Command handlers

pub mod auth;
pub mod config;
pub mod status;
pub mod store;
pub mod sync;
