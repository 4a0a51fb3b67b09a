use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use pubsub_client::{Client, ClientConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{self, FileConfig};
use crate::error::CliResult;

#[derive(Args)]
pub struct ConnectArgs {
    /// Backend host
    #[arg(long, global = true, env = "PUBSUB_HOST")]
    host: Option<String>,
    /// Backend port
    #[arg(long, global = true, env = "PUBSUB_PORT")]
    port: Option<u16>,
    /// YAML config file (host, port, timeouts); flags take precedence
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

impl ConnectArgs {
    async fn client_config(&self) -> CliResult<ClientConfig> {
        let file = match &self.config {
            Some(path) => config::load(path).await?,
            None => FileConfig::default(),
        };
        Ok(file.into_client_config(self.host.clone(), self.port))
    }

    async fn connect(&self) -> CliResult<Client> {
        let config = self.client_config().await?;
        Ok(Client::connect(config).await?)
    }
}

#[derive(Args)]
pub struct PublishArgs {
    channel: String,
    /// `:`-delimited payload
    message: String,
}

#[derive(Args)]
pub struct KeyArgs {
    key: String,
}

#[derive(Args)]
pub struct SubscribeArgs {
    #[arg(required = true)]
    channels: Vec<String>,
}

pub async fn run_publish(connect: &ConnectArgs, args: PublishArgs) -> CliResult<()> {
    let mut client = connect.connect().await?;
    let result = client.publish(&args.channel, &args.message).await;
    client.disconnect().await;
    result?;
    Ok(())
}

pub async fn run_set_publish(connect: &ConnectArgs, args: PublishArgs) -> CliResult<()> {
    let mut client = connect.connect().await?;
    let result = client.set_and_publish(&args.channel, &args.message).await;
    client.disconnect().await;
    result?;
    Ok(())
}

/// Exit status 1 when the key does not exist.
pub async fn run_get(connect: &ConnectArgs, args: KeyArgs) -> CliResult<ExitCode> {
    let mut client = connect.connect().await?;
    let result = client.get(&args.key).await;
    client.disconnect().await;

    match result? {
        Some(value) => {
            println!("{value}");
            Ok(ExitCode::SUCCESS)
        }
        None => Ok(ExitCode::from(1)),
    }
}

pub async fn run_switch(connect: &ConnectArgs, args: KeyArgs) -> CliResult<()> {
    let mut client = connect.connect().await?;
    let result = client.switch_state(&args.key).await;
    client.disconnect().await;

    let state = if result? {
        pubsub_client::SWITCH_ON
    } else {
        pubsub_client::SWITCH_OFF
    };
    println!("{state}");
    Ok(())
}

/// Print each message's tokens as a JSON array, one per line, until Ctrl-C
/// or a fatal subscriber error.
pub async fn run_subscribe(connect: &ConnectArgs, args: SubscribeArgs) -> CliResult<()> {
    let mut client = connect.connect().await?;

    client.set_channels(args.channels)?;
    client.set_handler(|tokens| match serde_json::to_string(&tokens) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Failed to serialize message: {e}"),
    })?;
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    client.set_error_handler(move |_| {
        let _ = failed_tx.send(());
    })?;

    client.start()?;
    info!(channels = ?client.channels(), "Subscribed, press Ctrl-C to stop");

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
        _ = failed_rx.recv() => false,
    };
    if interrupted {
        info!("Interrupted, stopping");
    }

    client.stop().await;
    let failure = client.take_last_error();
    client.disconnect().await;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
