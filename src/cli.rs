//! # Command-Line Interface Module
//!
//! Argument parsing for the `hixl-demo` binary. It uses the `clap` crate's
//! derive API, the same way the original benchmark suite did, to expose the
//! engine's public surface (§6) as a small CLI: initialize a local engine,
//! optionally register a memory region and connect to a peer, then run a
//! synchronous transfer.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Act as a server only, listening for peers.
//! hixl-demo --local 127.0.0.1:16000
//!
//! # Register a 4-byte host region and connect out to a peer.
//! hixl-demo --local 127.0.0.1:16001 --connect 127.0.0.1:16000 \
//!     --register 4 --connect-timeout 2s
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// `RegisterMem`'s `type` parameter (§3), exposed as a CLI choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MemKind {
    Host,
    Device,
}

/// Hixl — a point-to-point RDMA-style memory transfer engine demo.
///
/// Drives `Initialize`/`RegisterMem`/`Connect`/`TransferSync` against the
/// loopback transport so the engine's connect-and-transfer protocol can be
/// exercised end-to-end without RDMA hardware.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// This process's engine name (§6 "Engine name format"): `ip:port` to
    /// listen, or bare `ip`/`[ipv6]` to act as a client only.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub local: String,

    /// Peer engine name to `Connect` to after initializing, if any.
    #[arg(long)]
    pub connect: Option<String>,

    /// Registers a region of this many bytes before connecting, so the
    /// region is available to export to a peer immediately on connect.
    #[arg(long)]
    pub register: Option<u64>,

    /// Memory type of the `--register`ed region.
    #[arg(long, value_enum, default_value_t = MemKind::Host)]
    pub register_type: MemKind,

    /// Byte value the registered region is pre-filled with, so a peer's
    /// `--transfer-read` has something non-zero to observe.
    #[arg(long, default_value_t = 0)]
    pub fill: u8,

    /// After connecting, issue a synchronous `TransferSync(Read, ...)` of
    /// this many bytes from the peer's registered region into ours.
    #[arg(long)]
    pub transfer_read: Option<u64>,

    /// Deadline for `Connect`, accepting suffixes `ms`/`s`/`m`/`h` (no
    /// suffix means seconds), the same convention the teacher's benchmark
    /// CLI used for its duration flags.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub connect_timeout: Duration,

    /// Deadline for `TransferSync`.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub transfer_timeout: Duration,

    /// How long the process stays up after its actions complete, so a
    /// peer still has something to connect/transfer against.
    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub linger: Duration,

    /// Increases log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppresses the colorized stdout summary; detailed logs still go to
    /// the log file (or stderr, see `--log-file stderr`).
    #[arg(short, long)]
    pub quiet: bool,

    /// Where the detailed log layer writes; `stderr` for no file at all.
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Parses a duration with an optional unit suffix: `ms`, `s`, `m`, `h`.
/// No suffix is interpreted as seconds.
///
/// ```
/// # use std::time::Duration;
/// # use hixl::cli::parse_duration;
/// assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => unreachable!("exhaustive suffix match above"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn parses_millis() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_negative() {
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(parse_duration("").is_err());
    }
}
