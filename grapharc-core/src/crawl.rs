use crate::output::{CsvOutput, JsonLinesOutput, node_output_path};
use grapharc_scanner::error::Result;
use grapharc_scanner::resume::rebuild_state_from_path;
use grapharc_scanner::{CrawlSummary, Crawler, DefinitionRegistry, GraphClient, RecordSink};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Root type placeholder that asks the API for each root's type.
pub const DISCOVER: &str = "discover";

/// Options for crawling one or more root nodes
pub struct CrawlOptions {
    /// A definition name, or [`DISCOVER`].
    pub definition: String,
    pub node_ids: Vec<String>,
    pub max_levels: u32,
    pub exclude: Vec<String>,
    pub pretty: bool,
    /// One `<node>.jsonl` per root here, otherwise stdout.
    pub output_dir: Option<PathBuf>,
    pub csv_output_dir: Option<PathBuf>,
    /// Skip roots whose output file already exists.
    pub skip_existing: bool,
    pub show_progress_bars: bool,
}

/// Options for continuing an interrupted crawl
pub struct ResumeOptions {
    pub path: PathBuf,
    pub max_levels: u32,
    pub exclude: Vec<String>,
    pub show_progress_bars: bool,
}

/// Callback for reporting crawl progress
pub type CrawlProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

fn progress_bar(show: bool) -> Option<Arc<ProgressBar>> {
    if !show {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message("Starting crawl...");
    Some(Arc::new(pb))
}

/// Hands `message` to the caller's callback with the spinner cleared, so
/// both can write to the terminal.
fn notify(
    progress_bar: Option<&Arc<ProgressBar>>,
    callback: Option<&CrawlProgressCallback>,
    message: String,
) {
    let Some(callback) = callback else {
        return;
    };
    match progress_bar {
        Some(pb) => pb.suspend(|| callback(message)),
        None => callback(message),
    }
}

fn build_crawler(
    client: GraphClient,
    registry: Arc<DefinitionRegistry>,
    max_levels: u32,
    exclude: &[String],
    progress_bar: Option<Arc<ProgressBar>>,
) -> (Crawler, Arc<AtomicUsize>) {
    let processed_count = Arc::new(AtomicUsize::new(0));
    let mut crawler = Crawler::new(client, registry)
        .with_max_levels(max_levels)
        .with_exclude(exclude.iter().cloned());

    if let Some(pb) = progress_bar {
        let count_clone = processed_count.clone();
        crawler = crawler.with_progress_callback(Arc::new(move |queued: usize, batch: String| {
            let count = count_clone.fetch_add(1, Ordering::Relaxed) + 1;
            pb.set_message(format!(
                "Request {}: {} ({} nodes queued)",
                count, batch, queued
            ));
            pb.tick();
        }));
    }
    (crawler, processed_count)
}

/// Crawls every root in `options.node_ids` in turn.
///
/// CSV tables are shared by all roots; JSON output is one file per root (or
/// stdout). The first error aborts the run, leaving flushed output in place.
pub async fn execute_graphs(
    client: GraphClient,
    registry: Arc<DefinitionRegistry>,
    options: CrawlOptions,
    progress_callback: Option<CrawlProgressCallback>,
) -> Result<CrawlSummary> {
    let CrawlOptions {
        definition,
        node_ids,
        max_levels,
        exclude,
        pretty,
        output_dir,
        csv_output_dir,
        skip_existing,
        show_progress_bars,
    } = options;

    let progress_bar = progress_bar(show_progress_bars);
    let (crawler, processed_count) = build_crawler(
        client,
        registry.clone(),
        max_levels,
        &exclude,
        progress_bar.clone(),
    );

    let mut csv_output = match csv_output_dir {
        Some(dir) => Some(CsvOutput::create(dir, registry)?),
        None => None,
    };
    if let Some(ref dir) = output_dir {
        fs::create_dir_all(dir)?;
    }

    let roots: Vec<&str> = node_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();

    let mut summary = CrawlSummary::default();
    for (idx, node_id) in roots.iter().enumerate() {
        let mut json_output = match output_dir {
            Some(ref dir) => {
                let path = node_output_path(dir, node_id);
                if skip_existing && path.exists() {
                    info!("Skipping {}", node_id);
                    continue;
                }
                JsonLinesOutput::create(path, pretty)?
            }
            None => JsonLinesOutput::stdout(pretty),
        };

        let definition_name = if definition == DISCOVER {
            crawler
                .client()
                .discover_type(node_id)
                .await
                .map_err(|e| e.for_node(*node_id))?
        } else {
            definition.clone()
        };

        notify(
            progress_bar.as_ref(),
            progress_callback.as_ref(),
            format!(
                "Getting graph for node {} ({}) [{}/{}]",
                node_id,
                definition_name,
                idx + 1,
                roots.len()
            ),
        );

        let mut sinks: Vec<&mut dyn RecordSink> = vec![&mut json_output];
        if let Some(ref mut csv) = csv_output {
            sinks.push(csv);
        }
        let root_summary = crawler.crawl(node_id, &definition_name, &mut sinks).await?;
        json_output.finish()?;
        summary.merge(root_summary);
    }

    if let Some(ref mut csv) = csv_output {
        csv.finish()?;
    }
    if let Some(ref pb) = progress_bar {
        let total = processed_count.load(Ordering::Relaxed);
        pb.finish_with_message(format!("Crawl complete! {} requests", total));
    }

    Ok(summary)
}

/// Rebuilds the queue from a partial JSON-lines file and continues the crawl,
/// appending to the same file.
pub async fn execute_resume(
    client: GraphClient,
    registry: Arc<DefinitionRegistry>,
    options: ResumeOptions,
    progress_callback: Option<CrawlProgressCallback>,
) -> Result<CrawlSummary> {
    let progress_bar = progress_bar(options.show_progress_bars);
    let (crawler, processed_count) = build_crawler(
        client,
        registry.clone(),
        options.max_levels,
        &options.exclude,
        progress_bar.clone(),
    );

    let mut state = rebuild_state_from_path(&options.path, &registry, crawler.policy())?;
    notify(
        progress_bar.as_ref(),
        progress_callback.as_ref(),
        format!(
            "Resuming {} with {} nodes queued",
            options.path.display(),
            state.queue.len()
        ),
    );

    let mut json_output = JsonLinesOutput::append(&options.path, false)?;
    let summary = crawler.run(&mut state, &mut [&mut json_output]).await?;
    json_output.finish()?;

    if let Some(ref pb) = progress_bar {
        let total = processed_count.load(Ordering::Relaxed);
        pb.finish_with_message(format!("Crawl complete! {} requests", total));
    }
    Ok(summary)
}

/// Generate a crawl report from a summary
pub fn generate_crawl_report(summary: &CrawlSummary) -> String {
    let mut report = String::new();
    report.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Nodes archived: {}\n", summary.emitted));
    report.push_str(&format!("  Nodes skipped: {}\n", summary.skipped));
    report.push_str(&format!("  Requests made: {}\n", summary.requests));

    if !summary.emitted_by_type.is_empty() {
        report.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
        report.push_str("## By type\n");
        for (name, count) in &summary.emitted_by_type {
            report.push_str(&format!("  {:<12} {}\n", name, count));
        }
    }
    report.push('\n');
    report
}
