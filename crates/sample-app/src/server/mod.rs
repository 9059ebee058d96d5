//! Axum HTTP server, routing, and middleware.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Run each traced request as one unit of work (see [`middleware`]).
//! - Inject shared application state ([`state::AppState`]) into handlers.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
