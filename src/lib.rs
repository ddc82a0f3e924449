pub mod config;
pub mod error;
pub mod graph;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

#[cfg(test)]
mod test_fixtures;

pub use error::{AppError, ErrorDetail, ErrorResponse};
pub use models::*;
pub use services::*;
pub use validation::*;
