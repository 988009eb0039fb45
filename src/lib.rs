pub mod catalog;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod logging;
pub mod store;

pub use catalog::{Cardinality, FactKindSpec, FeedSpec, Summary, WindowBy};
pub use config::Config;
pub use engine::{Engine, QueryMode, QueryParams, QueryResult};
pub use ingest::{EntityRef, IngestMessage, IngestReport, RecordInput, ResolverCache};
pub use store::operations::snapshots::Window;
pub use store::{Store, StoreError};
