mod cmd;
mod config;
mod error;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "pubsub", version)]
struct Cli {
    #[command(flatten)]
    connect: cmd::ConnectArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a message on a channel
    Publish(cmd::PublishArgs),
    /// Publish a message and mirror its last token into a key
    SetPublish(cmd::PublishArgs),
    /// Print the value stored under a key
    Get(cmd::KeyArgs),
    /// Print the ON/OFF state of a switch key, initialising it to OFF
    Switch(cmd::KeyArgs),
    /// Print messages from one or more channels as JSON until interrupted
    Subscribe(cmd::SubscribeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Publish(args) => cmd::run_publish(&cli.connect, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::SetPublish(args) => cmd::run_set_publish(&cli.connect, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Get(args) => cmd::run_get(&cli.connect, args).await,
        Command::Switch(args) => cmd::run_switch(&cli.connect, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Subscribe(args) => cmd::run_subscribe(&cli.connect, args)
            .await
            .map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
