//! # Hixl Demo — Entry Point
//!
//! Drives the engine's public surface (§6) end to end: `Initialize`,
//! `RegisterMem`, `Connect`, `TransferSync`, `Disconnect`, `Finalize`.
//!
//! Because the only transport this crate carries without real RDMA
//! hardware is the loopback one (§4.11 — a real one-sided read/write
//! between two *registered* regions in the same address space), the demo
//! runs both sides of a connection as two [`hixl::HixlEngine`] instances in
//! this one process: a real TCP control-plane handshake happens between
//! them over `127.0.0.1`, and the one-sided data transfer moves real bytes
//! through their shared address space, exactly per scenario 1 of the
//! engine's testable properties. A genuinely separate peer process talking
//! RoCE/UB hardware is out of this crate's scope (§1).
//!
//! ## Architecture Overview
//!
//! 1. **Initialize logging**: structured logging via `tracing`, colorized
//!    for the terminal the same way the original benchmark suite's CLI did.
//! 2. **Parse arguments**: `clap`-derived `Args` (`--local`, `--connect`,
//!    `--register`, timeouts).
//! 3. **Initialize the local engine**, optionally registering a region.
//! 4. **If `--connect` is given**, stand up the in-process peer engine,
//!    connect to it, and run a synchronous transfer.
//! 5. **Linger**, if requested, so an external peer process can dial in.
//! 6. **Finalize** every engine instance before exiting.

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use hixl::{EndpointDescriptor, HixlEngine, MemType, Placement, Protocol, TransferOp, TransferOpDesc};

mod logging;
use logging::ColorizedFormatter;

use hixl::cli::{Args, MemKind};

/// Builds the single-RoCE-endpoint catalog the demo engines advertise.
///
/// A real deployment publishes whatever transports its hardware actually
/// has (§3 "Endpoint descriptor"); this demo only ever carries the
/// loopback transport, so it advertises one `Roce` endpoint and relies on
/// §4.5.1's "RoCE forced" rule (distinct `net_instance_id` per peer) to
/// guarantee the pairing algorithm always produces exactly one channel,
/// regardless of what real UB/HCCS planes a production catalog would list.
///
/// `net_instance_id` is the caller's own stand-in for the NIC identity a
/// real catalog would report; two engines sharing one OS process (as the
/// in-process demo peer does, see `run_connected_transfer`) must be given
/// distinct values explicitly; `std::process::id()` alone does not
/// distinguish them.
fn demo_catalog(net_instance_id: u64) -> Vec<EndpointDescriptor> {
    vec![EndpointDescriptor {
        protocol: Protocol::Roce,
        placement: Placement::Host,
        comm_id: "hixl-demo".to_string(),
        plane: None,
        dst_eid: None,
        net_instance_id: Some(net_instance_id),
    }]
}

/// Derives a stable per-engine `net_instance_id` from its engine name, so
/// the local engine and its in-process demo peer never collide even
/// though they share a `std::process::id()`.
fn instance_id_for(engine_name: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    engine_name.hash(&mut hasher);
    hasher.finish()
}

fn mem_type_of(kind: MemKind) -> MemType {
    match kind {
        MemKind::Host => MemType::Host,
        MemKind::Device => MemType::Device,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!(local = %args.local, "starting hixl engine");
    let engine = HixlEngine::initialize(&args.local, demo_catalog(instance_id_for(&args.local)), Default::default())
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    if let Some(addr) = engine.local_addr().await {
        info!(%addr, "listening for peers");
    }

    // Keep every buffer we register alive for the whole run: the engine
    // only ever sees the raw address, never takes ownership (§3 "Memory
    // descriptor").
    let mut local_buf: Option<Vec<u8>> = None;
    if let Some(len) = args.register {
        let mut buf = vec![args.fill; len as usize];
        let addr = buf.as_mut_ptr() as u64;
        engine
            .register_mem(addr, len, mem_type_of(args.register_type))
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        info!(addr, len, "registered local region");
        local_buf = Some(buf);
    }

    if let Some(peer_addr) = args.connect.clone() {
        run_connected_transfer(&engine, &args, &peer_addr, local_buf.as_deref()).await?;
    } else if !args.linger.is_zero() {
        info!(linger_ms = args.linger.as_millis() as u64, "lingering for peers to connect");
        tokio::time::sleep(args.linger).await;
    }

    engine.finalize().await.map_err(|e| anyhow!(e.to_string()))?;
    info!("hixl engine finalized");
    Ok(())
}

/// Stands up an in-process peer engine at `peer_addr`, connects our engine
/// to it, and — if `--transfer-read` was requested — issues a
/// `TransferSync(Read, ...)` that moves bytes from the peer's registered
/// region into ours, then tears both sides back down.
async fn run_connected_transfer(
    engine: &std::sync::Arc<hixl::HixlEngine>,
    args: &Args,
    peer_addr: &str,
    local_buf: Option<&[u8]>,
) -> Result<()> {
    let peer = HixlEngine::initialize(peer_addr, demo_catalog(instance_id_for(peer_addr)), Default::default())
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    let xfer_len = args.transfer_read.unwrap_or(4);
    let peer_fill = args.fill.wrapping_add(1);
    let mut peer_buf = vec![peer_fill; xfer_len as usize];
    let peer_addr_val = peer_buf.as_mut_ptr() as u64;
    peer.register_mem(peer_addr_val, xfer_len, mem_type_of(args.register_type))
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    // Kept alive for the rest of this function when we need a fresh
    // buffer; `local_addr_val` points into whichever one actually backs
    // the transfer.
    let mut fallback_buf = Vec::new();
    let local_addr_val = match local_buf {
        Some(buf) if buf.len() as u64 >= xfer_len => buf.as_ptr() as u64,
        _ => {
            fallback_buf = vec![0u8; xfer_len as usize];
            let addr = fallback_buf.as_mut_ptr() as u64;
            engine
                .register_mem(addr, xfer_len, mem_type_of(args.register_type))
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            addr
        }
    };

    info!(peer_addr, "connecting");
    engine
        .connect(peer_addr, args.connect_timeout.as_millis() as u32)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    let descs = [TransferOpDesc {
        local_addr: local_addr_val,
        remote_addr: peer_addr_val,
        len: xfer_len,
    }];
    engine
        .transfer_sync(peer_addr, TransferOp::Read, &descs, args.transfer_timeout.as_millis() as u32)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;

    // SAFETY: `local_addr_val` still points at a live buffer we (or the
    // caller) registered above and have not dropped.
    let observed = unsafe { std::slice::from_raw_parts(local_addr_val as *const u8, xfer_len as usize) };
    info!(first_byte = observed[0], expected = peer_fill, "transfer complete");
    if observed.iter().any(|&b| b != peer_fill) {
        warn!("transferred bytes did not match the peer's fill value");
    }

    engine
        .disconnect(peer_addr, args.connect_timeout.as_millis() as u32)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    peer.finalize().await.map_err(|e| anyhow!(e.to_string()))?;
    Ok(())
}

/// Wires up the same layered `tracing-subscriber` setup the original
/// benchmark CLI used: a detailed layer (file or stderr) at the verbosity
/// implied by `-v`/`-vv`, plus an optional colorized stdout summary layer
/// suppressed by `--quiet`.
fn init_logging(args: &Args) -> Result<()> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let detailed_log_layer = if args.log_file.as_deref() == Some("stderr") {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed()
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("hixl.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "hixl.log"),
        };
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
        // Leaked deliberately: the guard must outlive the process for the
        // non-blocking writer to flush on exit, and this binary has no
        // later point to hand it back to.
        Box::leak(Box::new(guard));
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed()
    };

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    Ok(())
}
