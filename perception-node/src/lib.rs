pub mod camera;
pub mod config;
pub mod error;
pub mod inference;
pub mod messaging;
pub mod processing;
pub mod recognition;
pub mod utils;

pub use error::{PerceptionError, Result};
