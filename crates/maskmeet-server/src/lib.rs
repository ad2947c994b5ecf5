//! MaskMeet Server Library
//!
//! Exposes the server components for testing and embedding.

pub mod api;
pub mod auth;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod session;
pub mod sfu;
pub mod state;
pub mod ws;

#[cfg(test)]
pub mod testutil;

use anyhow::Result;

/// Create and configure the server application.
///
/// The database pool is lazy: signalling and media work without the
/// store, REST handlers connect on first use.
pub fn create_app(config: state::Config) -> Result<(axum::Router, sqlx::PgPool)> {
    let db_pool = db::init_pool(&config.database_url)?;
    let app_state = state::AppState::new(config, db_pool.clone())?;
    let router = api::create_router(app_state);
    Ok((router, db_pool))
}
