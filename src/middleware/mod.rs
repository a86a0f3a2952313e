mod auth;
mod cors;
mod error_handler;

pub use auth::{AdminContext, require_admin};
pub use cors::{cors_headers, preflight};
pub use error_handler::{catch_panic, log_errors};
