//! Read path: SQL over the partitioned datasets via the external engine.

pub mod cache;
pub mod engine;
pub mod prefetch;
pub mod reader;

pub use cache::QueryCache;
pub use engine::{
    BatchExecutions, ExecutionIdPage, ExecutionState, QueryEngine, QueryExecution, ResultPage,
    ResultRow, StartQueryRequest,
};
pub use prefetch::{DependenciesPrefetch, DependenciesSource};
pub use reader::Reader;
