use clap::Parser;
use fabric_cni_agent::{Result, agent, config::AgentArgs};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    setup_subscriber();
    let args = AgentArgs::parse();

    let cancel = tokio_util::sync::CancellationToken::new();
    let mut agent_handle = tokio::spawn(agent::start(args, cancel.child_token()));
    let mut shutdown_handle = tokio::spawn(shutdown_signal());
    tokio::select! {
        h = &mut agent_handle => exit("agent", h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            if let Err(e) = agent_handle.await {
                error!("agent exited with error: {}", e.to_string());
            }
        },
    };
    info!("Exiting...");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fabric_cni_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
