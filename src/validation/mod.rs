pub mod refiner;
pub mod sql_validator;

pub use refiner::{CancelSignal, CorrectionRequest, Corrector, RefinerSettings, SqlRefiner};
pub use sql_validator::SqlValidator;
