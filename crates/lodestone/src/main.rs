//! lode - Lodestone supervisor CLI
//!
//! Thin entry point: argument parsing and error rendering live here,
//! command implementations in [`cli`], everything else in lodestone-core.

use clap::Parser;
use lodestone_core::error::format_error_with_remediation;

mod cli;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    if let Err(err) = cli::run(args).await {
        report_error(&err);
        std::process::exit(1);
    }
}

/// Core errors carry remediation guidance; render it when present.
fn report_error(err: &anyhow::Error) {
    if let Some(core) = err.downcast_ref::<lodestone_core::Error>() {
        eprintln!("{}", format_error_with_remediation(core));
    } else {
        eprintln!("Error: {err:#}");
    }
}
