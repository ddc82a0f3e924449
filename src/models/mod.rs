pub mod intent;
pub mod plan;
pub mod schema;
pub mod validation;

pub use intent::*;
pub use plan::*;
pub use schema::*;
pub use validation::*;
