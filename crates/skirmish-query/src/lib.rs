//! Query API server for Skirmish victories.
//!
//! This crate provides an Axum HTTP server that exposes the committed
//! contents of the victory windows:
//!
//! - **`GET /health`** for liveness plus partition and stream-time status
//! - **Per-round endpoints** returning the latest decision or a time range
//!   of decisions for one `arena_id/round_id`
//! - **Per-arena endpoints** scanning every round of an arena
//!
//! # Architecture
//!
//! Handlers call into [`VictoryQueryService`], which reads the snapshots
//! each partition task publishes at commit. The server never holds a
//! writer, so a slow client cannot stall processing.
//!
//! [`VictoryQueryService`]: skirmish_core::query::VictoryQueryService

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod startup;
pub mod state;

// Re-export primary types for convenience.
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
