//! HTTP surface: health check and the game WebSocket endpoint

pub mod routes;

pub use routes::build_router;
