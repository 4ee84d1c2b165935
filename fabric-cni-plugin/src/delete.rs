use tracing::{error, info};

use crate::client::{self, Verb};
use crate::config::Args;
use crate::response::Response;

pub async fn delete(args: &Args, network_configuration: Vec<u8>) -> Response {
    info!("delete called for container {}", args.container_id);
    match client::cmd(args, network_configuration, Verb::Delete).await {
        Ok(reply) => Response::from_reply(reply),
        Err(e) => {
            error!(%e, "delete request to the agent failed");
            e.into_response()
        }
    }
}
