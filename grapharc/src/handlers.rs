use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use colored::Colorize;
use grapharc_core::definitions::{load_registry, template_for, update_for};
use grapharc_scanner::error::ScanError;
use grapharc_scanner::query::node_request_url;
use grapharc_scanner::{DefinitionRegistry, GraphClient};
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Environment variable consulted when `--access-token` is not given.
pub const ACCESS_TOKEN_ENV: &str = "ACCESS_TOKEN";

// Re-export crawl types and functions from grapharc-core
pub use grapharc_core::crawl::{
    CrawlOptions, CrawlProgressCallback, DISCOVER, ResumeOptions, execute_graphs, execute_resume,
    generate_crawl_report,
};

/// Installs the stderr log subscriber.
pub fn init_logging(debug: bool, quiet: bool) {
    let level = if quiet {
        Level::WARN
    } else if debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

/// Expands a leading `~` in a user supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// The flag value if given, otherwise the environment value. Blank values
/// count as missing.
pub fn resolve_access_token(flag: Option<&str>, env: Option<String>) -> Option<String> {
    flag.map(str::to_string)
        .or(env)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Parse a single line as a node id, ignoring blanks
pub fn parse_node_line(line: &str) -> Option<String> {
    let id = line.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Load node ids from a reader, one per line
pub fn load_node_ids_from_reader<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for line in reader.lines() {
        if let Some(id) = parse_node_line(&line?) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Load node ids from a file
pub fn load_node_ids_from_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read node file {}", path.display()))?;
    Ok(content.lines().filter_map(parse_node_line).collect())
}

/// Load node ids from the given files in order, or from stdin when none are given
pub fn load_node_ids(files: &[PathBuf]) -> Result<Vec<String>> {
    let ids = if files.is_empty() {
        load_node_ids_from_reader(io::stdin().lock())?
    } else {
        let mut ids = Vec::new();
        for path in files {
            ids.extend(load_node_ids_from_file(path)?);
        }
        ids
    };
    if ids.is_empty() {
        bail!("No node ids found");
    }
    Ok(ids)
}

/// The definition registry, with overrides from `--definitions-dir`.
pub fn load_definitions(args: &ArgMatches) -> Result<Arc<DefinitionRegistry>> {
    let dir = args
        .get_one::<String>("definitions-dir")
        .map(|d| expand_path(d));
    let registry = load_registry(dir.as_deref()).context("Failed to load definitions")?;
    Ok(Arc::new(registry))
}

/// The `--delay` value as a duration.
pub fn parse_delay(seconds: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(delay) => Ok(delay),
        Err(_) => bail!("--delay must be a non-negative number of seconds, got {}", seconds),
    }
}

/// A client configured from the global flags.
pub fn build_client(args: &ArgMatches) -> Result<GraphClient> {
    let graph_url = args
        .get_one::<String>("graph-url")
        .map(String::as_str)
        .unwrap_or(grapharc_scanner::transport::DEFAULT_GRAPH_URL);
    let delay = parse_delay(*args.get_one::<f64>("delay").unwrap_or(&0.5))?;

    let token = resolve_access_token(
        args.get_one::<String>("access-token").map(String::as_str),
        std::env::var(ACCESS_TOKEN_ENV).ok(),
    );
    if token.is_none() {
        eprintln!(
            "{} No access token given; requests will be unauthenticated.",
            "⚠".yellow().bold()
        );
    }

    let client = GraphClient::new(graph_url, token)?
        .with_min_interval(delay);
    Ok(client)
}

/// Rejects definition names the registry does not know, accepting `discover`
/// where allowed.
pub fn check_definition(
    registry: &DefinitionRegistry,
    definition: &str,
    allow_discover: bool,
) -> Result<()> {
    if (allow_discover && definition == DISCOVER) || registry.contains(definition) {
        return Ok(());
    }
    bail!(
        "Unknown definition '{}'. Known definitions: {}",
        definition,
        registry.names().join(", ")
    )
}

fn exclude_list(args: &ArgMatches) -> Vec<String> {
    args.get_many::<String>("exclude")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn expand_dir(args: &ArgMatches, name: &str) -> Option<PathBuf> {
    args.get_one::<PathBuf>(name)
        .map(|p| expand_path(&p.to_string_lossy()))
}

fn stderr_progress() -> CrawlProgressCallback {
    Arc::new(|msg: String| {
        eprintln!("{} {}", "→".blue(), msg);
    })
}

fn print_summary(summary: &grapharc_scanner::CrawlSummary, quiet: bool) {
    if quiet {
        return;
    }
    eprintln!("\n{} Crawl complete!\n", "✓".green().bold());
    eprint!("{}", generate_crawl_report(summary));
}

/// `graph` and `graphs`
pub async fn handle_graphs(args: &ArgMatches, multiple: bool) -> Result<()> {
    let quiet = args.get_flag("quiet");
    let registry = load_definitions(args)?;
    let definition = args
        .get_one::<String>("DEFINITION")
        .context("DEFINITION is required")?
        .clone();
    check_definition(&registry, &definition, true)?;

    let node_ids = if multiple {
        let files: Vec<PathBuf> = args
            .get_many::<PathBuf>("FILE")
            .map(|files| files.cloned().collect())
            .unwrap_or_default();
        load_node_ids(&files)?
    } else {
        let node = args.get_one::<String>("NODE").context("NODE is required")?;
        vec![node.clone()]
    };

    for excluded in exclude_list(args) {
        check_definition(&registry, &excluded, false)?;
    }

    let options = CrawlOptions {
        definition,
        node_ids,
        max_levels: *args.get_one::<u32>("levels").unwrap_or(&1),
        exclude: exclude_list(args),
        pretty: args.get_flag("pretty"),
        output_dir: expand_dir(args, "output-dir"),
        csv_output_dir: expand_dir(args, "csv-output-dir"),
        skip_existing: multiple && args.get_flag("skip"),
        show_progress_bars: !quiet,
    };

    let client = build_client(args)?;
    let progress = (!quiet).then(stderr_progress);
    let summary = execute_graphs(client, registry, options, progress).await?;
    print_summary(&summary, quiet);
    Ok(())
}

/// `resume`
pub async fn handle_resume(args: &ArgMatches) -> Result<()> {
    let quiet = args.get_flag("quiet");
    let registry = load_definitions(args)?;
    let path = args
        .get_one::<PathBuf>("FILE")
        .map(|p| expand_path(&p.to_string_lossy()))
        .context("FILE is required")?;
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }

    let options = ResumeOptions {
        path,
        max_levels: *args.get_one::<u32>("levels").unwrap_or(&1),
        exclude: exclude_list(args),
        show_progress_bars: !quiet,
    };
    let client = build_client(args)?;
    let progress = (!quiet).then(stderr_progress);
    let summary = execute_resume(client, registry, options, progress).await?;
    print_summary(&summary, quiet);
    Ok(())
}

/// `metadata`
pub async fn handle_metadata(args: &ArgMatches) -> Result<()> {
    let node = args.get_one::<String>("NODE").context("NODE is required")?;
    let client = build_client(args)?;

    if args.get_flag("template") || args.get_flag("update") {
        let metadata = client
            .parsed_metadata(node)
            .await
            .map_err(|e| e.for_node(node.as_str()))?;
        let definition = if args.get_flag("update") {
            let registry = load_definitions(args)?;
            update_for(&registry, &metadata)?
        } else {
            template_for(&metadata)?
        };
        println!("{}", definition);
        return Ok(());
    }

    let metadata = client
        .metadata(node)
        .await
        .map_err(|e| e.for_node(node.as_str()))?;
    let output = if args.get_flag("pretty") {
        serde_json::to_string_pretty(&metadata)?
    } else {
        serde_json::to_string(&metadata)?
    };
    println!("{}", output);
    Ok(())
}

/// `url`
pub fn handle_url(args: &ArgMatches) -> Result<()> {
    let registry = load_definitions(args)?;
    let definition = args
        .get_one::<String>("DEFINITION")
        .context("DEFINITION is required")?;
    let node = args.get_one::<String>("NODE").context("NODE is required")?;
    check_definition(&registry, definition, false)?;

    let graph_url = args
        .get_one::<String>("graph-url")
        .map(String::as_str)
        .unwrap_or(grapharc_scanner::transport::DEFAULT_GRAPH_URL);
    let url = node_request_url(
        &registry,
        graph_url,
        node,
        definition,
        args.get_flag("escape"),
    )?;
    println!("{}", url);
    Ok(())
}

/// `definitions`
pub fn handle_definitions(args: &ArgMatches) -> Result<()> {
    let registry = load_definitions(args)?;
    for name in registry.names() {
        let definition = registry.get(&name)?;
        println!(
            "{:<12} {} default fields, {} edges, batch size {}",
            name.bright_white().bold(),
            definition.default_fields.len(),
            definition.default_edges.len() + definition.on_demand_edges.len(),
            definition.node_batch_size
        );
    }
    Ok(())
}

/// Extra guidance for API errors with a known cause.
pub fn error_hint(error: &ScanError) -> Option<&'static str> {
    let api = error.api_error()?;
    match (api.code, api.subcode) {
        (100, _) => Some("Use a user token instead of an app token."),
        (190, Some(490)) => Some("Security check triggered. Log into your account in a browser."),
        (190, _) => Some("The access token is invalid or expired."),
        _ => None,
    }
}

/// Prints a failed command's error, naming the node being processed when known.
pub fn report_failure(error: &anyhow::Error) {
    match error.downcast_ref::<ScanError>() {
        Some(scan_error) => {
            match scan_error {
                ScanError::Node { node_id, source } => eprintln!(
                    "{} Error processing {}: {}",
                    "✗".red().bold(),
                    node_id.bright_white(),
                    source
                ),
                other => eprintln!("{} Error: {}", "✗".red().bold(), other),
            }
            if let Some(hint) = error_hint(scan_error) {
                eprintln!("{} {}", "Hint:".yellow().bold(), hint);
            }
        }
        None => eprintln!("{} {:#}", "✗".red().bold(), error),
    }
}
