use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use socket_session::{
    SessionOptions,
    cli::{Cli, Command, ConnectionArgs},
    spawn_session,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn load_options(args: &ConnectionArgs) -> Result<SessionOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let document = fs::read_to_string(path)
                .with_context(|| format!("failed to read options from {}", path.display()))?;
            SessionOptions::from_json(&document).context("invalid options document")?
        }
        None => SessionOptions::default(),
    };
    if let Some(delay) = args.reconnect_delay_ms {
        options.reconnection_delay_ms = delay;
    }
    if let Some(attempts) = args.max_reconnect_attempts {
        options.max_reconnection_attempts = attempts;
    }
    if args.no_reconnect {
        options.auto_reconnect_on_error = false;
    }
    Ok(options)
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let options = load_options(&cli.connection)?;
    let credentials = parse_json(&cli.connection.credentials, "credentials")?;

    let session = spawn_session(options);
    session
        .connect_with_auth(cli.connection.url.clone(), credentials, |outcome| match outcome {
            Ok(granted) => info!(session = %granted, "logged in"),
            Err(err) => warn!(%err, "login failed"),
        })
        .await?;
    session.wait_until_connected().await?;

    match cli.command {
        Command::Echo(args) => {
            let data = parse_json(&args.data, "echo data")?;
            let reply = session.echo(&data).await?;
            println!("{}", serde_json::to_string_pretty(&reply.received)?);
            info!(echo_at = reply.echo_at, "echo answered");
        }
        Command::Request(args) => {
            let data = parse_json(&args.data, "request data")?;
            let response = session.request_raw(args.name, data).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Listen(args) => {
            for group in &args.groups {
                session.join_group(group).await?;
                info!(%group, "joined group");
            }
            for subject in args.subjects {
                let label = subject.clone();
                session
                    .on_message_received(&subject, move |message| match message {
                        Ok(data) => println!("[{label}] {data}"),
                        Err(err) => warn!(subject = %label, %err, "broadcast carried an error"),
                    })
                    .await?;
            }
            tokio::signal::ctrl_c().await?;
        }
    }

    if let Err(err) = session.logout().await {
        warn!(%err, "logout failed");
    }
    Ok(())
}
