use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = ccharvest::cli::Cli::parse();

    match cli.command {
        ccharvest::cli::Command::Crawl(args) => {
            let config = args.resolve().context("resolve config")?;
            ccharvest::logging::init_with(Some(&config.log)).context("init logging")?;
            tracing::debug!(?args, "parsed cli");
            let summary = ccharvest::orchestrator::crawl(config).await.context("crawl")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("encode run summary")?
            );
        }
        ccharvest::cli::Command::Catalog(args) => {
            ccharvest::logging::init().context("init logging")?;
            tracing::debug!(?args, "parsed cli");
            ccharvest::catalog::run(args).await.context("catalog")?;
        }
        ccharvest::cli::Command::Entries(args) => {
            ccharvest::logging::init().context("init logging")?;
            tracing::debug!(?args, "parsed cli");
            ccharvest::segment::run(args).context("entries")?;
        }
    }

    Ok(())
}
