use tracing::{error, info};

use crate::client::{self, Verb};
use crate::config::Args;
use crate::response::Response;

pub async fn add(args: &Args, network_configuration: Vec<u8>) -> Response {
    info!("add called for container {}", args.container_id);
    match client::cmd(args, network_configuration, Verb::Add).await {
        Ok(reply) => Response::from_reply(reply),
        Err(e) => {
            error!(%e, "add request to the agent failed");
            e.into_response()
        }
    }
}
