pub mod app;
pub mod loader;

pub use app::{AppConfig, ServerConfig};
pub use loader::ConfigLoader;
