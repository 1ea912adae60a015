use anyhow::Context;
use clap::Parser;
use deskmirror_cli::cli::{Cli, Commands};
use deskmirror_cli::commands;
use deskmirror_client::{HelpdeskClient, RemoteConfig};
use deskmirror_core::{MirrorConfig, MirrorEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deskmirror_core::o11y::init_tracing_from_env().context("init tracing")?;

    let cli = Cli::parse();
    if let Commands::Config = cli.command {
        println!(
            "{}",
            serde_json::to_string_pretty(&commands::describe_config(&cli.global))?
        );
        return Ok(());
    }

    let mirror_cfg =
        MirrorConfig::from_lookup(|k| cli.global.lookup(k)).context("mirror configuration")?;
    let remote_cfg =
        RemoteConfig::from_lookup(|k| cli.global.lookup(k)).context("helpdesk configuration")?;
    let client = HelpdeskClient::new(&remote_cfg)?;

    let engine = MirrorEngine::open(Arc::new(client), &mirror_cfg)
        .await
        .with_context(|| format!("opening mirror at {}", mirror_cfg.db_path.display()))?;
    tracing::info!(db_path = %mirror_cfg.db_path.display(), remote = %remote_cfg.base_url, "mirror ready");

    let out = match commands::execute(&engine, cli.command).await {
        Ok(out) => out,
        Err(e) => {
            for line in commands::field_error_lines(&e) {
                eprintln!("  {line}");
            }
            return Err(e);
        }
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
