//! Route handlers for the HTTP API.

pub mod admin;
pub mod cookies;
pub mod events;
pub mod files;
pub mod health;
pub mod jobs;
