#![forbid(unsafe_code)]

use sm_tools::{CliCommand, CliOptions, GraphDocument, render};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = match CliOptions::parse(std::env::args().skip(1))? {
        CliCommand::Run(options) => options,
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
    };

    if options.verbose {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::DEBUG.into())
            .from_env_lossy();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let path = options.graph.as_deref().ok_or("--graph is required")?;
    let document = GraphDocument::from_path(path)?;
    println!("{}", render(&options, &document)?);
    Ok(())
}

fn print_help() {
    println!(
        "sqlmodels-cli\n\
         Usage:\n\
         \tsqlmodels-cli --graph graph.json [--dialect postgres|bigquery|athena] [--mode sql|statements|nodes]\n\
         Options:\n\
         \t--graph <file>       JSON graph document to compile\n\
         \t--dialect <name>     Target dialect, overriding the document's\n\
         \t--mode <mode>        sql (default), statements or nodes\n\
         \t--path <a/b>         With --mode nodes, show only the node at this reference path\n\
         \t--no-start-node      With --mode statements, leave out the root statement\n\
         \t-v, --verbose        Log to stderr (filter with RUST_LOG)\n\
         \t-h, --help           Show this help"
    );
}
