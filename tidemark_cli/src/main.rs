use clap::Parser;
use tidemark_cli::cli::{Cli, Commands};
use tidemark_core::config::{sources_from_env, SyncSettings};
use tidemark_core::SyncEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tidemark_core::o11y::init_tracing(cli.global.debug, cli.global.log_format)?;

    let settings = cli.global.settings();
    settings.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if let Err(e) = run(&settings).await {
                tracing::error!(error = %e, "sync failed");
                return Err(e);
            }
        }
        Commands::Validate => {
            let sources = sources_from_env()?;
            for (index, source) in sources.iter().enumerate() {
                println!(
                    "{index}: {} -> {}",
                    source.source.tag(),
                    source.effective_source_type()
                );
            }
            println!("ok: {} source(s)", sources.len());
        }
        Commands::Config => {
            let sources = sources_from_env()?
                .iter()
                .map(|s| s.redacted())
                .collect::<Result<Vec<_>, _>>()?;
            let cfg = serde_json::json!({
                "cache_dir": settings.cache_dir,
                "dry_run": settings.dry_run,
                "debug": settings.debug,
                "max_attempts": settings.retry.max_attempts,
                "retry_backoff_ms": u64::try_from(settings.retry.backoff_base.as_millis()).unwrap_or(u64::MAX),
                "sources": sources,
            });
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }
    Ok(())
}

#[tracing::instrument(level = "info", skip_all, fields(dry_run = settings.dry_run))]
async fn run(settings: &SyncSettings) -> anyhow::Result<()> {
    let sources = sources_from_env()?;
    let pipelines = tidemark_integrations::build_pipelines(&sources, settings)?;
    let engine = SyncEngine::new(settings.retry.clone())
        .with_dry_run(settings.dry_run)
        .with_debug(settings.debug);

    let reports = engine.run(&pipelines).await?;
    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }
    tracing::info!(sources = reports.len(), "sync finished");
    Ok(())
}
