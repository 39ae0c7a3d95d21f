//! Streams level one equity quotes for the symbols given on the command line.
//!
//! Credentials come from `.env` / the environment (`SCHWAB_APP_KEY_<LABEL>`,
//! `SCHWAB_APP_SECRET_<LABEL>`, `CALLBACK_URL`); `SCHWAB_INSTANCE` picks the
//! label and `SCHWAB_CONFIG` an optional TOML config file.

use std::{env, time::Duration};

use anyhow::Context;
use schwab_client::{ClientConfig, ClientIdentity, SchwabClient, StreamEvent};
use tokio::signal;

const LEVELONE_EQUITIES: &str = "LEVELONE_EQUITIES";
const QUOTE_FIELDS: [u32; 9] = [0, 1, 2, 3, 4, 5, 8, 10, 12];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let label = env::var("SCHWAB_INSTANCE").unwrap_or_else(|_| "1".to_string());
    let identity = ClientIdentity::from_env(&label).context("loading credentials")?;
    let config = match env::var("SCHWAB_CONFIG") {
        Ok(path) => ClientConfig::from_file(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => ClientConfig::default(),
    };

    let mut symbols: Vec<String> = env::args().skip(1).collect();
    if symbols.is_empty() {
        symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
    }

    let client = SchwabClient::builder()
        .identity(identity)
        .config(config)
        .build()
        .await?;
    client.tokens().ensure_valid().await?;

    let stream = client.stream();
    let reader = stream.open().await?;

    let mut runner = {
        let stream = stream.clone();
        tokio::spawn(async move {
            stream
                .run(reader, |event| match event {
                    StreamEvent::Data(items) => {
                        for item in items {
                            for quote in item.content {
                                tracing::info!(service = %item.service, %quote, "update");
                            }
                        }
                    }
                    StreamEvent::Response(responses) => {
                        for response in responses {
                            tracing::info!(
                                command = ?response.command,
                                code = ?response.code(),
                                msg = ?response.message(),
                                "response"
                            );
                        }
                    }
                    StreamEvent::Notify(items) => tracing::debug!(?items, "notify"),
                    StreamEvent::Unknown(value) => tracing::debug!(%value, "unrecognised frame"),
                })
                .await
        })
    };

    stream.wait_logged_in(Duration::from_secs(30)).await?;
    stream
        .subscribe(LEVELONE_EQUITIES, &symbols, &QUOTE_FIELDS)
        .await?;
    tracing::info!(?symbols, "streaming quotes; press Ctrl+C to exit");

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("shutting down");
            stream.stop().await;
            runner.await.context("stream task panicked")??;
        }
        finished = &mut runner => {
            finished.context("stream task panicked")??;
            tracing::info!("stream ended");
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
