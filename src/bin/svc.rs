// ABOUTME: Service binary hosting one codec session per process
// ABOUTME: Exit codes: 0 normal, 1 bad arguments, 2 codec unavailable, 3 transport failure

use argh::FromArgs;
use avpipe::codec::PIPE_BUFFER_SIZE;
use avpipe::service::{serve, ServeError};
use std::process::ExitCode;
use tracing::error;

/// Out-of-process H.264/HEVC codec service.
#[derive(FromArgs)]
struct Args {
    /// instance name identifying the transport endpoint
    #[argh(positional)]
    instance_id: String,

    /// transport buffer size in bytes
    #[argh(option, default = "PIPE_BUFFER_SIZE")]
    buffer_bytes: usize,

    /// enable debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    if args.instance_id.is_empty() {
        error!("instance id must not be empty");
        return ExitCode::from(1);
    }

    match serve(&args.instance_id, args.buffer_bytes).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ServeError::NoCodecs) => {
            error!(error = %e, "service not started");
            ExitCode::from(2)
        }
        Err(e @ ServeError::Transport(_)) => {
            error!(error = %e, "service not started");
            ExitCode::from(3)
        }
    }
}
