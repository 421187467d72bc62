use clap::Parser;
use error_stack::{Result, ResultExt};
use evm_sync::{cli::Cli, error::SyncError};
use evm_sync_observability::init_opentelemetry;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    let args = Cli::parse();
    run_with_args(args).await
}

async fn run_with_args(args: Cli) -> Result<(), SyncError> {
    init_opentelemetry(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .change_context(SyncError::Fatal)
        .attach_printable("failed to initialize opentelemetry")?;

    let ct = CancellationToken::new();

    ctrlc::set_handler({
        let ct = ct.clone();
        move || {
            info!("SIGINT received");
            ct.cancel();
        }
    })
    .change_context(SyncError::Fatal)
    .attach_printable("failed to set SIGINT handler")?;

    args.run(ct).await
}
