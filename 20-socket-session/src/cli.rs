use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Server address: ws://, wss://, http://, https:// or a bare host.
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    pub url: String,

    /// Login credentials as a JSON document.
    #[arg(long, default_value = "{}")]
    pub credentials: String,

    /// JSON options file; flags below override its values.
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Pause between reconnection attempts, in milliseconds.
    #[arg(long)]
    pub reconnect_delay_ms: Option<u64>,

    /// Consecutive failures tolerated before giving up.
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Stay disconnected after a transport error.
    #[arg(long)]
    pub no_reconnect: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a value to the server's echo call and print the reply.
    Echo(EchoArgs),
    /// Call a named request with a JSON payload and print the response.
    Request(RequestArgs),
    /// Print broadcasts on the given subjects until ctrl-c.
    Listen(ListenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EchoArgs {
    /// JSON value to echo.
    #[arg(default_value = "\"ping\"")]
    pub data: String,
}

#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Request name.
    pub name: String,

    /// JSON payload.
    #[arg(default_value = "null")]
    pub data: String,
}

#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// Subjects to subscribe to.
    #[arg(required = true)]
    pub subjects: Vec<String>,

    /// Groups to join before listening.
    #[arg(long = "group")]
    pub groups: Vec<String>,
}
