pub mod config;
pub mod routes;
pub mod server;

pub use config::{Args, ServerConfig};
pub use routes::{build_cors, router};
