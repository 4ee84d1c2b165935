use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use fabric_cni_plugin::add::add;
use fabric_cni_plugin::check::check;
use fabric_cni_plugin::config::{Args, Command};
use fabric_cni_plugin::delete::delete;
use fabric_cni_plugin::version::version;
use fabric_cni_plugin::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = setup_logging();
    let args = Args::parse();
    let resp = match args.command {
        Command::Version => version(),
        Command::Add | Command::Delete | Command::Check => match read_input() {
            Ok(input) => match args.command {
                Command::Add => add(&args, input).await,
                Command::Delete => delete(&args, input).await,
                Command::Check => check(&args, input).await,
                Command::Version => version(),
            },
            Err(e) => e.into_response(),
        },
    };

    resp.write_out()
}

fn read_input() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

fn setup_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("/var/log/fabric-cni", "cni.log");
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fabric_cni_plugin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(nonblocking))
        .init();
    guard
}
