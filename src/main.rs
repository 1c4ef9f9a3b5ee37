use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bmidb::manager::{self, SystemProfile};
use bmidb::server::{BmiServer, ServerOptions};
use bmidb::service::RecordService;
use bmidb::{BmiDb, StoreOptions};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:5000")]
    addr: SocketAddr,

    /// Record log file; created if missing.
    #[clap(long, default_value = "bmidb_log.dat")]
    log_file: PathBuf,

    /// Ids are allocated strictly above this value.
    #[clap(long, default_value = "0")]
    counter_floor: u64,

    /// Do not serve /static assets.
    #[clap(long)]
    no_static: bool,

    /// Skip fsync on append regardless of the detected profile.
    #[clap(long)]
    no_fsync: bool,

    /// Seconds between background compactions; 0 disables them.
    #[clap(long, default_value = "600")]
    compact_interval: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bmidb=info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let profile = SystemProfile::detect();
    info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        strict_durability = profile.strict_durability && !args.no_fsync,
        "resource profile"
    );

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(async_main(args, profile))
}

async fn async_main(args: Args, profile: SystemProfile) -> anyhow::Result<()> {
    let options = StoreOptions {
        strict_durability: profile.strict_durability && !args.no_fsync,
        counter_floor: args.counter_floor,
    };

    let db = Arc::new(
        BmiDb::open(&args.log_file, options)
            .with_context(|| format!("failed to open record log {}", args.log_file.display()))?,
    );

    if args.compact_interval > 0 {
        manager::start_gc_thread(db.clone(), Duration::from_secs(args.compact_interval));
    }

    let service = RecordService::new(db);
    let server = BmiServer::new(
        service,
        ServerOptions {
            with_static: !args.no_static,
        },
    );

    server
        .run(args.addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;

    info!("shutting down");
    Ok(())
}
