pub mod crawler;
pub mod definition;
pub mod error;
pub mod paging;
pub mod query;
pub mod result;
pub mod resume;
pub mod sink;
pub mod transport;

pub use crawler::{CrawlState, CrawlTask, Crawler, ProgressCallback, TraversalPolicy};
pub use definition::{Definition, DefinitionRegistry, DefinitionSource};
pub use error::{GraphApiError, ScanError};
pub use result::{CrawlSummary, NodeMetadata};
pub use sink::RecordSink;
pub use transport::{GraphClient, RetryPolicy};
