use anyhow::Context;
use clap::Parser;
use impairment_pipeline::FileSource;

use crate::config::cli::{CliOpt, Command, ValidateOpt};

mod capture;
mod config;
mod logging;
mod report;
mod run;
mod signals;

fn main() -> anyhow::Result<()> {
    let options = CliOpt::parse();
    logging::init(&options.log_level, options.log_format)?;

    match options.command {
        Command::Run(run) => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to initialize tokio")?;
            rt.block_on(run::run(run))
        }
        Command::Validate(validate) => validate_config(&validate),
    }
}

fn validate_config(options: &ValidateOpt) -> anyhow::Result<()> {
    let source = FileSource::new(&options.config);
    let snapshot = impairment_pipeline::config::load(&source)
        .with_context(|| format!("invalid configuration in {}", options.config.display()))?;

    println!("{} is valid", options.config.display());
    report::print_snapshot(&snapshot);
    Ok(())
}
