pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::LauncherConfig;
pub use db::Database;
pub use errors::{LauncherError, Result};
