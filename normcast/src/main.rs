// normcast: copy a byte stream to or from a NORM multicast group.

mod config;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use norm_core::engine::Engine;
use norm_core::io::{NormInputStream, NormOutputStream};
use norm_core::sim::SimEngine;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "normcast", version, about = "Send and receive byte streams over NORM multicast")]
struct Cli {
    /// Config file (default: ~/.config/normcast/config.toml, then /etc/normcast/config.toml).
    #[arg(long, env = "NORMCAST_CONFIG")]
    config: Option<PathBuf>,
    /// Group address, overriding the config.
    #[arg(long, short)]
    address: Option<String>,
    #[arg(long, short)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send FILE (or stdin for "-") as one stream.
    Send {
        #[arg(default_value = "-")]
        input: PathBuf,
    },
    /// Receive one stream and write it to stdout or OUTPUT.
    Recv {
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Send FILE to a receiver in this process and echo it to stdout.
    Loopback {
        #[arg(default_value = "-")]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(address) = cli.address {
        cfg.session.address = address;
    }
    if let Some(port) = cli.port {
        cfg.session.port = port;
    }

    let bytes = match cli.command {
        Command::Send { input } => send(engine(), cfg, input).await?,
        Command::Recv { output } => recv(engine(), cfg, output).await?,
        Command::Loopback { input } => loopback(cfg, input).await?,
    };
    info!(bytes, "done");
    Ok(())
}

#[cfg(feature = "native")]
fn engine() -> Arc<dyn Engine> {
    Arc::new(norm_core::ffi::NativeEngine::new())
}

#[cfg(not(feature = "native"))]
fn engine() -> Arc<dyn Engine> {
    warn!(
        "built without the native feature; using the in-process engine, nothing leaves this process"
    );
    Arc::new(SimEngine::new())
}

fn open_source(path: &Path) -> io::Result<Box<dyn Read + Send>> {
    if path == Path::new("-") {
        Ok(Box::new(io::stdin()))
    } else {
        Ok(Box::new(File::open(path)?))
    }
}

fn open_sink(path: Option<&Path>) -> io::Result<Box<dyn Write + Send>> {
    match path {
        Some(p) => Ok(Box::new(File::create(p)?)),
        None => Ok(Box::new(io::stdout())),
    }
}

fn open_output(engine: Arc<dyn Engine>, cfg: &Config) -> anyhow::Result<Arc<NormOutputStream>> {
    let output = NormOutputStream::new(engine, &cfg.session.address, cfg.session.port)?;
    cfg.session.apply(output.session())?;
    output
        .open(&cfg.sender.params(), cfg.sender.repair_window)
        .context("failed to open sender stream")?;
    if let Some(mode) = cfg.sender.auto_flush {
        output.set_auto_flush(mode)?;
    }
    if cfg.sender.push_enable {
        output.set_push_enable(true)?;
    }
    Ok(Arc::new(output))
}

fn open_input(engine: Arc<dyn Engine>, cfg: &Config) -> anyhow::Result<Arc<NormInputStream>> {
    let input = NormInputStream::new(engine, &cfg.session.address, cfg.session.port)?;
    cfg.session.apply(input.session())?;
    cfg.receiver.apply(input.session())?;
    input
        .open(cfg.receiver.buffer_space)
        .context("failed to start receiver")?;
    Ok(Arc::new(input))
}

fn spawn_send(output: Arc<NormOutputStream>, input: PathBuf) -> JoinHandle<anyhow::Result<u64>> {
    tokio::task::spawn_blocking(move || {
        let mut source = open_source(&input).with_context(|| format!("open {}", input.display()))?;
        let n = io::copy(&mut source, &mut &*output)?;
        output.finish();
        debug!(bytes = n, "sender finished");
        Ok(n)
    })
}

fn spawn_recv(
    input: Arc<NormInputStream>,
    sink: Box<dyn Write + Send>,
) -> JoinHandle<anyhow::Result<u64>> {
    tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        let n = io::copy(&mut &*input, &mut sink)?;
        sink.flush()?;
        Ok(n)
    })
}

async fn send(engine: Arc<dyn Engine>, cfg: Config, input: PathBuf) -> anyhow::Result<u64> {
    let output = open_output(engine, &cfg)?;
    info!(address = %cfg.session.address, port = cfg.session.port, "sending");
    let task = spawn_send(output.clone(), input);
    until_shutdown(task, || output.close()).await
}

async fn recv(
    engine: Arc<dyn Engine>,
    cfg: Config,
    output: Option<PathBuf>,
) -> anyhow::Result<u64> {
    let sink = open_sink(output.as_deref())?;
    let input = open_input(engine, &cfg)?;
    info!(address = %cfg.session.address, port = cfg.session.port, "receiving");
    let task = spawn_recv(input.clone(), sink);
    until_shutdown(task, || input.close()).await
}

async fn loopback(cfg: Config, input: PathBuf) -> anyhow::Result<u64> {
    let engine: Arc<dyn Engine> = Arc::new(SimEngine::new());
    let receiver = open_input(engine.clone(), &cfg)?;
    let sender = open_output(engine, &cfg)?;
    let rx = spawn_recv(receiver.clone(), Box::new(io::stdout()));
    let tx = spawn_send(sender.clone(), input);
    let sent = until_shutdown(tx, || sender.close()).await?;
    let received = until_shutdown(rx, || receiver.close()).await?;
    if sent != received {
        warn!(sent, received, "loopback lost bytes");
    }
    Ok(received)
}

/// Await `task`; on Ctrl-C or SIGTERM call `close` (which unblocks the copy) and
/// report what had been copied.
async fn until_shutdown(
    mut task: JoinHandle<anyhow::Result<u64>>,
    close: impl FnOnce(),
) -> anyhow::Result<u64> {
    tokio::select! {
        res = &mut task => res?,
        sig = shutdown_signal() => {
            sig?;
            info!("shutting down");
            close();
            match task.await? {
                Ok(n) => Ok(n),
                Err(e) => {
                    debug!(error = %e, "copy interrupted");
                    Ok(0)
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["normcast", "-p", "7000", "send", "file.bin"]).unwrap();
        assert_eq!(cli.port, Some(7000));
        assert!(
            matches!(cli.command, Command::Send { ref input } if input == Path::new("file.bin"))
        );
        let cli = Cli::try_parse_from(["normcast", "recv"]).unwrap();
        assert!(matches!(cli.command, Command::Recv { output: None }));
        assert!(Cli::try_parse_from(["normcast"]).is_err());
    }

    #[tokio::test]
    async fn loopback_copies_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let cfg = Config::default();
        let engine: Arc<dyn Engine> = Arc::new(SimEngine::new());
        let receiver = open_input(engine.clone(), &cfg).unwrap();
        let sender = open_output(engine, &cfg).unwrap();
        let out = dir.path().join("out.bin");
        let rx = spawn_recv(receiver, open_sink(Some(out.as_path())).unwrap());
        let sent = spawn_send(sender, path).await.unwrap().unwrap();
        let received = rx.await.unwrap().unwrap();
        assert_eq!(sent, payload.len() as u64);
        assert_eq!(received, sent);
        assert_eq!(std::fs::read(&out).unwrap(), payload);
    }
}
