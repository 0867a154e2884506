pub mod access;
pub mod cache;
pub mod caches;
pub mod config;
pub mod dashboard;
mod engine;
pub mod http;
pub mod query;
pub mod render;
pub mod store;
pub mod telemetry;

pub use engine::{AuthError, RenderEngine, RenderEngineBuilder};
