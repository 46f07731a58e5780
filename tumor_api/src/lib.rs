mod server;

pub mod app;
pub mod config;
pub mod history;
pub mod routes;
pub mod telemetry;
pub mod uploads;

pub use app::start_app;
pub use server::{build_router, HttpServer, SharedState};
