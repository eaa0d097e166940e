//! Admin surface: plain async functions over `AppState`. The HTTP router in
//! `server::router` exposes each of them under `/admin`.

pub mod config;
pub mod remote;
pub mod routes;
pub mod stats;
