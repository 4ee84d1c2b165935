use clap::Parser;

use crate::{Error, Result, client::DEFAULT_CNI_SOCKET};

/// The CNI environment contract: the runtime passes everything except
/// the network configuration through environment variables.
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Possible values are ADD, DEL, CHECK, VERSION
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    pub command: Command,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the container network namespace
    #[arg(long, env = "CNI_NETNS", default_value = "")]
    pub net_ns: String,

    /// Interface name to create inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "eth0")]
    pub ifname: String,

    /// Key-value pairs separated by semicolons
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// List of paths to search for CNI executables
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub paths: String,

    /// Agent socket path
    #[arg(long, env = "FABRIC_CNI_SOCKET", default_value = DEFAULT_CNI_SOCKET)]
    pub socket: String,
}

fn parse_command(s: &str) -> Result<Command> {
    let cmd = match s {
        "ADD" => Command::Add,
        "DEL" => Command::Delete,
        "CHECK" => Command::Check,
        "VERSION" => Command::Version,
        _ => return Err(Error::Parse(format!("command {s} not supported"))),
    };
    Ok(cmd)
}

#[derive(Clone, Copy)]
pub enum Command {
    Add,
    Delete,
    Check,
    Version,
}
