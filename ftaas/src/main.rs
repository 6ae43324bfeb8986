use std::path::Path;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use ftaas::config::{Args, Command};
use ftaas::{Config, FileContent, StreamingClient, TransferOutcome, UploadRequest, telemetry};
use futures::StreamExt;

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, canceling transfers...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, canceling transfers...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    tracing::debug!("{:?}", args);

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let client = StreamingClient::from_config(&config)?;

    match command {
        Command::Token => {
            let credential = client.get_token().await?;
            let summary = serde_json::json!({
                "token_type": credential.token_type(),
                "expires_in_secs": credential.validity().as_secs(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Upload {
            business_type_id,
            tenant_id,
            race,
            files,
        } => {
            let mut items = Vec::with_capacity(files.len());
            for file in &files {
                let name = file_name(file)?;
                let content = FileContent::open(file)
                    .await
                    .with_context(|| format!("failed to open {}", file.display()))?;
                items.push((UploadRequest::new(name, business_type_id), content));
            }

            let mut batch = client.first_completed(items, tenant_id.as_deref()).await;
            let mut outcomes = Vec::with_capacity(batch.len());

            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            let mut canceled = false;

            loop {
                tokio::select! {
                    outcome = batch.next() => {
                        let Some(outcome) = outcome else { break };
                        if race {
                            print_outcome(&outcome)?;
                        }
                        outcomes.push(outcome);
                    }
                    _ = &mut shutdown, if !canceled => {
                        batch.cancel();
                        canceled = true;
                    }
                }
            }

            if !race {
                outcomes.sort_by_key(|outcome| outcome.index);
                for outcome in &outcomes {
                    print_outcome(outcome)?;
                }
            }

            let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} uploads failed", outcomes.len());
            }
            Ok(())
        }
    }
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn print_outcome(outcome: &TransferOutcome) -> anyhow::Result<()> {
    let line = match &outcome.result {
        Ok(info) => serde_json::json!({ "request": outcome.request, "result": info }),
        Err(e) => serde_json::json!({ "request": outcome.request, "error": e.to_string() }),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
