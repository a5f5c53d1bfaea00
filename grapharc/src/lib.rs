// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    expand_path, load_node_ids, load_node_ids_from_file, load_node_ids_from_reader,
    parse_node_line, resolve_access_token,
};

// Re-export crawl functionality from grapharc-core
pub use grapharc_core::crawl::{
    CrawlOptions, CrawlProgressCallback, ResumeOptions, execute_graphs, execute_resume,
    generate_crawl_report,
};
