pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod records;
pub mod services;
pub mod storage;

pub use error::{AppError, Result};
