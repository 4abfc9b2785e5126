mod behavior;
mod cli;
mod modes;
mod session;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let code = run().await;
    // Exit directly: a blocking stdin read parked in the runtime must not
    // hold the process open after cancellation.
    std::process::exit(code);
}

async fn run() -> i32 {
    // Match classic netcat: invoking without any argument prints usage.
    if std::env::args().len() <= 1 {
        cli::print_usage();
        return 0;
    }

    let args = cli::Args::parse();
    let config = match cli::build_config(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gonc: {err}");
            return 1;
        }
    };

    init_tracing(config.verbose);

    if config.dry_run {
        eprintln!("gonc: configuration valid (dry-run)");
        return 0;
    }

    let token = CancellationToken::new();
    spawn_signal_watcher(token.clone());

    let mode = match modes::build(&config) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("gonc: {err}");
            return 1;
        }
    };

    match mode.run(&token).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("gonc: {err}");
            1
        }
    }
}

/// Map the repeatable `-v` onto level filters; RUST_LOG still wins when set.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Cancel the root token on interrupt or termination.
fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        token.cancel();
    });
}
