//! Web API: routing, authentication, error mapping, and the HTTP/WS
//! handlers.

pub mod audit;
pub mod auth;
pub mod connections;
pub mod error;
pub mod extractors;
pub mod keys;
pub mod rate_limit;
pub mod routes;
pub mod sessions;
pub mod stripe;
pub mod ws;

pub use routes::create_router;
