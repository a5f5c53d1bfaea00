use crate::CLAP_STYLING;
use clap::{arg, command};
use grapharc_scanner::transport::DEFAULT_GRAPH_URL;
use std::path::PathBuf;

fn levels_arg() -> clap::Arg {
    arg!(--"levels" <N>)
        .required(false)
        .help("Number of levels of nodes to retrieve (0 for no limit)")
        .value_parser(clap::value_parser!(u32))
        .default_value("1")
}

fn exclude_arg() -> clap::Arg {
    arg!(--"exclude" <TYPE>)
        .required(false)
        .help("Node types to leave out of recursive retrieval")
        .num_args(1..)
        .action(clap::ArgAction::Append)
}

fn crawl_output_args(cmd: clap::Command) -> clap::Command {
    cmd.arg(levels_arg())
        .arg(exclude_arg())
        .arg(
            arg!(--"pretty")
                .required(false)
                .help("Pretty print JSON output")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            arg!(--"output-dir" <PATH>)
                .required(false)
                .help("Write each root's records to <node>.jsonl in this directory (default: stdout)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            arg!(--"csv-output-dir" <PATH>)
                .required(false)
                .help("Also write records as one CSV file per node type in this directory")
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("grapharc")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("grapharc")
        .about("Archive a connection-graph API by breadth-first crawling")
        .styles(CLAP_STYLING)
        .arg(
            arg!(-q --"quiet" "Only log warnings and errors")
                .required(false)
                .global(true),
        )
        .arg(
            arg!(--"debug" "Log every request")
                .required(false)
                .global(true)
                .conflicts_with("quiet"),
        )
        .arg(
            arg!(--"access-token" <TOKEN>)
                .required(false)
                .global(true)
                .help("Access token for the API (default: $ACCESS_TOKEN)"),
        )
        .arg(
            arg!(--"delay" <SECONDS>)
                .required(false)
                .global(true)
                .help("Minimum delay between requests")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.5"),
        )
        .arg(
            arg!(--"graph-url" <URL>)
                .required(false)
                .global(true)
                .help("Base URL of the graph API")
                .default_value(DEFAULT_GRAPH_URL),
        )
        .arg(
            arg!(--"definitions-dir" <PATH>)
                .required(false)
                .global(true)
                .help("Directory of <type>.json definitions overriding the bundled ones"),
        )
        .subcommand_required(true)
        .subcommand(crawl_output_args(
            command!("graph")
                .about("Retrieve a node and the nodes connected to it")
                .arg(
                    arg!(<DEFINITION>)
                        .help("Node type definition to use, or 'discover' to ask the API"),
                )
                .arg(arg!(<NODE>).help("Id or username of the node to retrieve")),
        ))
        .subcommand(
            crawl_output_args(
                command!("graphs")
                    .about("Retrieve several nodes, reading ids from files or stdin")
                    .arg(
                        arg!(<DEFINITION>)
                            .help("Node type definition to use, or 'discover' to ask the API"),
                    )
                    .arg(
                        arg!([FILE] ...)
                            .help("Files containing one node id per line (default: stdin)")
                            .value_parser(clap::value_parser!(PathBuf)),
                    ),
            )
            .arg(
                arg!(--"skip")
                    .required(false)
                    .help("Skip nodes whose output file already exists")
                    .action(clap::ArgAction::SetTrue),
            ),
        )
        .subcommand(
            command!("resume")
                .about("Continue an interrupted retrieval from its JSON lines output")
                .arg(
                    arg!(<FILE>)
                        .help("Output file of the interrupted run")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(levels_arg())
                .arg(exclude_arg()),
        )
        .subcommand(
            command!("metadata")
                .about("Retrieve the metadata the API reports for a node")
                .arg(arg!(<NODE>).help("Id or username of the node"))
                .arg(
                    arg!(--"pretty")
                        .required(false)
                        .help("Pretty print JSON output")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"template")
                        .required(false)
                        .help("Print a new definition listing every field of the node's type")
                        .action(clap::ArgAction::SetTrue)
                        .conflicts_with("update"),
                )
                .arg(
                    arg!(--"update")
                        .required(false)
                        .help("Print the existing definition with any missing fields added")
                        .action(clap::ArgAction::SetTrue)
                        .conflicts_with("template"),
                ),
        )
        .subcommand(
            command!("url")
                .about("Print the request URL used to retrieve a node")
                .arg(arg!(<DEFINITION>).help("Node type definition to use"))
                .arg(arg!(<NODE>).help("Id or username of the node"))
                .arg(
                    arg!(--"escape")
                        .required(false)
                        .help("Percent-encode the query string")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(command!("definitions").about("List the known node type definitions"))
}
