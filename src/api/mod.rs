//! HTTP control surface for the research engine.

mod auth;
mod research;
mod routes;

pub use routes::{router, serve, AppState};
