//! # Hixl
//!
//! A point-to-point RDMA-style memory transfer engine. Cooperating processes
//! register regions of host or device memory and perform one-sided
//! reads/writes of those regions across a network of heterogeneous
//! transports (loopback today; RoCE and the on-chip Unified-Bus protocols
//! are represented as a documented stub seam, see [`transport::stub`]).
//!
//! The public surface is [`engine::HixlEngine`]: `Initialize`, `RegisterMem`,
//! `Connect`, `TransferSync`/`TransferAsync`, `GetTransferStatus`,
//! `Disconnect`, `Finalize`.

pub mod cli;
pub mod client;
pub mod codec;
pub mod completion;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod memory;
pub mod segment;
pub mod server;
pub mod status;
pub mod transport;

pub use endpoint::{EndpointDescriptor, Placement, Protocol};
pub use engine::{HixlEngine, Request};
pub use error::{EngineError, Result};
pub use memory::{MemHandle, MemType};
pub use status::{Status, TransferStatus};
pub use transport::{TransferOp, TransferOpDesc};

/// The current version of the engine crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
