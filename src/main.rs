mod config;
mod event;
mod privacy;
mod query;
mod reference;
mod satellite;
mod server;
mod storage;
mod subs;
mod sweep;
mod ws;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};

use config::Settings;
use event::Validator;
use reference::RelayIdentity;
use satellite::SatelliteRegistry;
use server::RelayState;
use storage::Store;
use subs::SubscriptionRegistry;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "fitstr",
    author,
    version,
    about = "Health and fitness relay for Nostr"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Validate and store one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild secondary indexes from stored events.
    Reindex,
    /// Launch the relay: protocol listener, admin endpoints, and sweeper.
    Serve,
    /// Re-verify signatures for a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::new(cfg.store_root.clone());
    match cli.command {
        Commands::Init => {
            store.init()?;
        }
        Commands::Ingest { files } => {
            let validator = Validator {
                clock_skew_future: cfg.clock_skew_future_seconds,
                verify_sig: cfg.verify_sig,
            };
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let ev: event::Event = serde_json::from_str(&data)?;
                validator
                    .validate(&ev, event::now_ts())
                    .map_err(|e| anyhow::anyhow!("{f}: {e}"))?;
                store.put(&ev)?;
            }
        }
        Commands::Reindex => {
            store.reindex()?;
        }
        Commands::Serve => {
            store.init()?;
            let addr: SocketAddr = cfg.listen_addr.parse()?;
            // Routing for PRIVATE events needs the persisted registrations
            // back in memory before the listener accepts anything.
            let satellites = SatelliteRegistry::load(
                cfg.store_root.join("satellites"),
                cfg.satellite_liveness_seconds,
            )?;
            let identity = RelayIdentity::from_secret_hex(&cfg.relay_secret_key)?;
            let validator = Validator {
                clock_skew_future: cfg.clock_skew_future_seconds,
                verify_sig: cfg.verify_sig,
            };
            let sweep_period = Duration::from_secs(cfg.expiry_sweep_interval_seconds);
            let state = Arc::new(RelayState {
                store: store.clone(),
                subs: SubscriptionRegistry::new(),
                satellites,
                validator,
                identity,
                cfg,
                accept_lock: parking_lot::Mutex::new(()),
            });
            tokio::spawn(sweep::run(store, sweep_period));
            tracing::info!(%addr, "relay listening");
            server::serve(addr, state, shutdown_signal()).await?;
        }
        Commands::Verify { sample } => {
            store.verify_sample(sample)?;
        }
    }
    Ok(())
}

/// Resolve when the process receives ctrl-c.
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::ENV_MUTEX;
    use crate::event::testing::signed_event;
    use std::{fs, time::Duration};
    use tempfile::TempDir;
    use tokio::task;

    fn clear_env() {
        for v in [
            "STORE_ROOT",
            "LISTEN_ADDR",
            "RELAY_SECRET_KEY",
            "VERIFY_SIG",
            "EXPIRY_SWEEP_INTERVAL_SECONDS",
        ] {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, listen: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nLISTEN_ADDR={}\nRELAY_SECRET_KEY={}\nVERIFY_SIG=1\n",
            dir.path().to_str().unwrap(),
            listen,
            "01".repeat(32),
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn run_init_ingest_reindex_verify() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "127.0.0.1:0");

        run(Cli {
            env: env_file.clone(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let ev = signed_event(1301, 1, vec![]);
        let ev_path = dir.path().join("ev.json");
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
            },
        })
        .await
        .unwrap();

        run(Cli {
            env: env_file.clone(),
            command: Commands::Reindex,
        })
        .await
        .unwrap();

        run(Cli {
            env: env_file,
            command: Commands::Verify { sample: 10 },
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ingest_rejects_invalid_events() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "127.0.0.1:0");
        run(Cli {
            env: env_file.clone(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let mut ev = signed_event(1301, 1, vec![]);
        ev.sig = "00".repeat(64);
        let ev_path = dir.path().join("bad.json");
        fs::write(&ev_path, serde_json::to_string(&ev).unwrap()).unwrap();
        let res = run(Cli {
            env: env_file,
            command: Commands::Ingest {
                files: vec![ev_path.to_str().unwrap().into()],
            },
        })
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn run_serve_starts_listener() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let env_file = write_env(&dir, &format!("127.0.0.1:{port}"));

        let handle = task::spawn(run(Cli {
            env: env_file,
            command: Commands::Serve,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let url = format!("http://127.0.0.1:{port}/healthz");
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success());
        handle.abort();
    }
}
