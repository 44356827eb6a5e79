//! Document preview service
//!
//! Converts stored office documents to PDF in the background, with a durable
//! job record per conversion, bounded retries, and single-use signed links
//! for viewing the result.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
