use fabric_cni_api::cni::v1::cni_client::CniClient;
use fabric_cni_api::cni::v1::{CniCmdArgs, CniCmdRequest, CniCmdResponse};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::{Result, config::Args};

pub const DEFAULT_CNI_SOCKET: &str = "/var/run/fabric/cni.sock";

#[derive(Clone, Copy)]
pub enum Verb {
    Add,
    Delete,
    Check,
}

/// Forwards one CNI invocation to the agent over its Unix socket.
pub async fn cmd(
    args: &Args,
    network_configuration: Vec<u8>,
    verb: Verb,
) -> Result<CniCmdResponse> {
    let mut client = connect(&args.socket).await?;
    let request = CniCmdRequest {
        cni_args: Some(CniCmdArgs {
            container_id: args.container_id.clone(),
            ifname: args.ifname.clone(),
            netns: args.net_ns.clone(),
            args: args.args.clone(),
            network_configuration,
        }),
    };
    let response = match verb {
        Verb::Add => client.cmd_add(request).await?,
        Verb::Delete => client.cmd_del(request).await?,
        Verb::Check => client.cmd_check(request).await?,
    };
    Ok(response.into_inner())
}

async fn connect(socket_path: &str) -> Result<CniClient<Channel>> {
    let socket_path = socket_path.to_owned();
    // The URI is never dialed; the connector below always opens the
    // Unix socket.
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(socket_path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(CniClient::new(channel))
}
