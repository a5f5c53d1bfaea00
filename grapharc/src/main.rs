use commands::command_argument_builder;
use grapharc::handlers::{
    handle_definitions, handle_graphs, handle_metadata, handle_resume, handle_url, init_logging,
    report_failure,
};

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();

    let Some((name, sub_matches)) = chosen_command.subcommand() else {
        unreachable!("clap should ensure we don't get here")
    };
    // Global flags are propagated to the subcommand's matches.
    init_logging(sub_matches.get_flag("debug"), sub_matches.get_flag("quiet"));

    let result = match name {
        "graph" => handle_graphs(sub_matches, false).await,
        "graphs" => handle_graphs(sub_matches, true).await,
        "resume" => handle_resume(sub_matches).await,
        "metadata" => handle_metadata(sub_matches).await,
        "url" => handle_url(sub_matches),
        "definitions" => handle_definitions(sub_matches),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = result {
        report_failure(&e);
        std::process::exit(1);
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
