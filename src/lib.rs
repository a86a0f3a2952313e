use config::Config;
use platform::Platform;

pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod platform;
pub mod routes;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub platform: Platform,
}
