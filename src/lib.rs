//! Outfit analysis client
//!
//! This library talks to the outfit-analysis backend: it manages the bearer
//! session, submits clothing photos for asynchronous analysis, polls the
//! resulting jobs, and hands completed results to the results view.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
