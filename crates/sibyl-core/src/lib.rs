pub mod config;
pub mod error;
pub mod types;

pub use config::SibylConfig;
pub use error::{Result, SibylError};
pub use types::*;
