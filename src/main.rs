//! peer-cache: command-line client for peer-cache nodes.
//!
//! Issues a single RPC against one peer and prints the result to stdout.
//! Plain `get` streams the value as it arrives; everything else uses the
//! blocking client on a worker thread.

use std::io::Write;
use std::ops::ControlFlow;

use clap::Parser;
use tracing::info;

use peer_cache::client::{FetchEvent, PeerClient, StoreStatus};
use peer_cache::config::{Cli, Command, Config};
use peer_cache::protocol::ReadEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr; stdout carries results.
    let filter = if cli.verbose {
        "peer_cache=debug"
    } else {
        "peer_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration.
    let config = Config::load(&cli.config)?;
    info!(
        peer = %cli.peer,
        signed = config.protocol.secret.is_some(),
        signing = ?config.protocol.signing,
        "peer-cache v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = PeerClient::from_config(&config);
    match cli.command {
        Command::Get {
            key,
            offset: None,
            length: None,
        } => stream_value(&client, &cli.peer, &key).await,
        command => {
            let peer = cli.peer;
            tokio::task::spawn_blocking(move || run(&client, &peer, command)).await?
        }
    }
}

/// Stream a whole value to stdout.
async fn stream_value(client: &PeerClient, peer: &str, key: &str) -> anyhow::Result<()> {
    let fetch = client
        .fetch_async(peer, key.as_bytes(), 0, 0, None, |event| match event {
            FetchEvent::Data(ReadEvent::Chunk { data, .. }) => {
                match std::io::stdout().write_all(data) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            }
            _ => ControlFlow::Continue(()),
        })
        .await?;
    fetch.wait().await?;
    std::io::stdout().flush()?;
    Ok(())
}

fn run(client: &PeerClient, peer: &str, command: Command) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    match command {
        Command::Get {
            key,
            offset,
            length,
        } => {
            let value = client.fetch_offset(
                peer,
                key.as_bytes(),
                offset.unwrap_or(0),
                length.unwrap_or(0),
                None,
            )?;
            stdout.write_all(&value)?;
        }
        Command::Set {
            key,
            value,
            expire,
            no_reply,
        } => {
            let status = client.set(
                peer,
                key.as_bytes(),
                value.as_bytes(),
                expire,
                !no_reply,
                None,
            )?;
            writeln!(stdout, "{}", store_label(status))?;
        }
        Command::Add {
            key,
            value,
            expire,
            no_reply,
        } => {
            let status = client.add(
                peer,
                key.as_bytes(),
                value.as_bytes(),
                expire,
                !no_reply,
                None,
            )?;
            writeln!(stdout, "{}", store_label(status))?;
        }
        Command::Delete { key, no_reply } => {
            client.delete(peer, key.as_bytes(), !no_reply, None)?;
            writeln!(stdout, "OK")?;
        }
        Command::Evict { key, no_reply } => {
            client.evict(peer, key.as_bytes(), !no_reply, None)?;
            writeln!(stdout, "OK")?;
        }
        Command::Exists { key } => {
            let exists = client.exists(peer, key.as_bytes(), None)?;
            writeln!(stdout, "{}", if exists { "YES" } else { "NO" })?;
        }
        Command::Touch { key } => {
            client.touch(peer, key.as_bytes(), None)?;
            writeln!(stdout, "OK")?;
        }
        Command::Stats => {
            let stats = client.stats(peer, None)?;
            writeln!(stdout, "{}", stats.trim_end())?;
        }
        Command::Check => {
            client.check(peer, None)?;
            writeln!(stdout, "OK")?;
        }
        Command::Index => {
            for item in client.index(peer, None)? {
                writeln!(
                    stdout,
                    "{}\t{}",
                    String::from_utf8_lossy(&item.key),
                    item.value_len
                )?;
            }
        }
        Command::MigrateAbort => {
            client.migrate_abort(peer, None)?;
            writeln!(stdout, "OK")?;
        }
    }
    stdout.flush()?;
    Ok(())
}

fn store_label(status: StoreStatus) -> &'static str {
    match status {
        StoreStatus::Stored => "STORED",
        StoreStatus::Exists => "EXISTS",
        StoreStatus::Sent => "SENT",
    }
}
