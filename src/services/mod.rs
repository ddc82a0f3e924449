pub mod cache;
pub mod connection_pool;
pub mod database; // Trial-execution targets
pub mod dialect;
pub mod llm_service;
pub mod plan_builder;
pub mod query_service;
pub mod sql_generator;

pub use cache::{CacheManager, CacheService, CacheStats, MemoryCache};
pub use connection_pool::{mask_credentials, ConnectionPoolManager};
pub use database::{create_executor, DatabaseType, TrialExecutor};
pub use llm_service::LlmCorrector;
pub use plan_builder::QueryPlanBuilder;
pub use query_service::{CompiledQuery, QueryCompiler};
pub use sql_generator::SqlGenerator;
