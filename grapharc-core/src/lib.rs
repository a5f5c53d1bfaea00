pub mod crawl;
pub mod definitions;
pub mod output;

pub use crawl::{
    CrawlOptions, CrawlProgressCallback, DISCOVER, ResumeOptions, execute_graphs, execute_resume,
    generate_crawl_report,
};
pub use definitions::{bundled_registry, load_registry};
pub use output::{CsvOutput, JsonLinesOutput};
