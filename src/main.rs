//! Send and receive byte streams through a unidirectional data diode.
//!
//! # Usage
//!
//! ## Receiver (start first):
//! ```bash
//! diode receive 10.0.0.2 > out.bin
//! ```
//!
//! ## Sender:
//! ```bash
//! diode send 10.0.0.1 10.0.0.2 < in.bin
//! ```
//!
//! Exit codes: 0 on clean completion, 1 on unrecoverable protocol or I/O
//! errors, 2 when the receiver ends with an incomplete stream.

use std::io::{self, Read};
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{error, info, warn, Level};

use diode::{DiodeConfig, DiodeReceiver, DiodeSender, ReceiveOutcome};

#[derive(Parser, Debug)]
#[command(name = "diode")]
#[command(about = "Send and receive data through a data diode via UDP")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Print DEBUG logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read octets from stdin and transmit them one-way
    Send {
        /// IP of the interface data is sent from
        src_ip: IpAddr,

        /// IP the receiver listens on
        dst_ip: IpAddr,

        /// Destination port
        #[arg(long, default_value_t = 1234)]
        port: u16,

        /// Target throughput in bytes per second (0 = unpaced)
        #[arg(long, default_value_t = 125_000_000)]
        rate: u64,

        /// Bytes per chunk (one chunk per datagram)
        #[arg(long, default_value_t = 1024)]
        chunk_bytes: usize,

        /// Data chunks per block
        #[arg(long, default_value_t = 64)]
        k: usize,

        /// Parity chunks per block
        #[arg(long, default_value_t = 32)]
        r: usize,

        /// How many times to send the terminal block
        #[arg(long, default_value_t = 3)]
        redundant_final: u32,

        /// How many times to send every block
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Receive octets and write them to stdout
    Receive {
        /// IP of the interface to listen on
        listen_ip: IpAddr,

        /// Listen port
        #[arg(long, default_value_t = 1234)]
        port: u16,

        /// Give up after this many seconds without a packet
        #[arg(long, default_value_t = 2.0)]
        idle_timeout: f64,

        /// Bytes per chunk (must match the sender)
        #[arg(long, default_value_t = 1024)]
        chunk_bytes: usize,

        /// Data chunks per block (must match the sender)
        #[arg(long, default_value_t = 64)]
        k: usize,

        /// Parity chunks per block (must match the sender)
        #[arg(long, default_value_t = 32)]
        r: usize,

        /// Maximum in-flight blocks buffered for reordering
        #[arg(long, default_value_t = 64)]
        window: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(args.command).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Send {
            src_ip,
            dst_ip,
            port,
            rate,
            chunk_bytes,
            k,
            r,
            redundant_final,
            repeat,
        } => {
            let config = DiodeConfig {
                chunk_bytes,
                k,
                r,
                rate,
                repeat,
                redundant_final,
                ..DiodeConfig::default()
            };
            run_send(config, src_ip, dst_ip, port).await
        }
        Command::Receive {
            listen_ip,
            port,
            idle_timeout,
            chunk_bytes,
            k,
            r,
            window,
        } => {
            anyhow::ensure!(
                idle_timeout > 0.0 && idle_timeout.is_finite(),
                "idle timeout must be a positive number of seconds"
            );
            let config = DiodeConfig {
                chunk_bytes,
                k,
                r,
                window_blocks: window,
                idle_timeout: Duration::from_secs_f64(idle_timeout),
                ..DiodeConfig::default()
            };
            run_receive(config, listen_ip, port).await
        }
    }
}

async fn run_send(config: DiodeConfig, src_ip: IpAddr, dst_ip: IpAddr, port: u16) -> Result<ExitCode> {
    let socket = UdpSocket::bind((src_ip, 0))
        .await
        .with_context(|| format!("failed to bind {src_ip}"))?;
    socket
        .connect((dst_ip, port))
        .await
        .with_context(|| format!("failed to set destination {dst_ip}:{port}"))?;
    info!(
        "sending to {}:{} (k={}, r={}, chunk={}B, rate={}B/s)",
        dst_ip, port, config.k, config.r, config.chunk_bytes, config.rate
    );

    let mut sender = DiodeSender::new(config, socket)?;

    // Stdin reader thread feeding a bounded channel, so disk/pipe reads
    // overlap with paced transmission.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);
    let reader = std::thread::spawn(move || -> io::Result<()> {
        let mut stdin = io::stdin().lock();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = stdin.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                return Ok(());
            }
        }
    });

    while let Some(data) = rx.recv().await {
        sender.push(&data).await.context("transmission failed")?;
    }
    match reader.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err).context("reading stdin failed"),
        Err(_) => anyhow::bail!("stdin reader panicked"),
    }

    let stats = sender.finish().await.context("transmission failed")?;
    info!(
        blocks = stats.blocks,
        packets = stats.packets,
        bytes = stats.data_bytes,
        "transfer complete"
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_receive(config: DiodeConfig, listen_ip: IpAddr, port: u16) -> Result<ExitCode> {
    let socket = UdpSocket::bind((listen_ip, port))
        .await
        .with_context(|| format!("failed to bind {listen_ip}:{port}"))?;
    info!(
        "listening on {}:{} (k={}, r={}, chunk={}B)",
        listen_ip, port, config.k, config.r, config.chunk_bytes
    );

    let mut receiver = DiodeReceiver::new(config, socket)?;
    let mut out = io::stdout().lock();

    let result = tokio::select! {
        result = receiver.run(&mut out) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match result {
        Some(outcome) => match outcome.context("receive failed")? {
            ReceiveOutcome::Complete => Ok(ExitCode::SUCCESS),
            ReceiveOutcome::Incomplete => Ok(ExitCode::from(2)),
        },
        None => {
            // Graceful close: force whatever the window can still emit out,
            // then flush the partial stream.
            warn!("interrupted, draining window and flushing partial output");
            if let Err(err) = receiver.drain(&mut out) {
                warn!(%err, "best-effort drain failed");
            }
            Ok(ExitCode::from(2))
        }
    }
}
