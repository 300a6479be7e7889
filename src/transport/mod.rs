//! Transport abstraction (Design Note "Dynamic dispatch"): the variety of
//! wire transports behind one interface, and a table from [`CommType`] to
//! the transport instance carrying it.
//!
//! Shaped after the teacher's `IpcTransport` trait (`async_trait`, one
//! implementation per underlying mechanism, a factory selecting by name);
//! see `loopback.rs` for the one fully-working implementation and
//! `stub.rs` for the documented seam where a real RoCE/UB driver binds in.

pub mod loopback;
pub mod stub;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// The concrete transport class a channel was negotiated over, derived from
/// the endpoint-pairing algorithm (§4.5.1) and used to classify transfers
/// (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommType {
    Roce,
    UbDeviceToDevice,
    UbDeviceToHost,
    UbHostToDevice,
    UbHostToHost,
}

impl CommType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommType::Roce => "ROCE",
            CommType::UbDeviceToDevice => "UB_D2D",
            CommType::UbDeviceToHost => "UB_D2H",
            CommType::UbHostToDevice => "UB_H2D",
            CommType::UbHostToHost => "UB_H2H",
        }
    }
}

impl std::fmt::Display for CommType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ParseCommType(local_placement, remote_placement)` from
/// `hixl_client.cc`: device+device -> D2D, device+host -> D2H,
/// host+host -> H2H, else -> H2D.
pub fn parse_comm_type(local: crate::endpoint::Placement, remote: crate::endpoint::Placement) -> CommType {
    use crate::endpoint::Placement::{Device, Host};
    match (local, remote) {
        (Device, Device) => CommType::UbDeviceToDevice,
        (Device, Host) => CommType::UbDeviceToHost,
        (Host, Host) => CommType::UbHostToHost,
        (Host, Device) => CommType::UbHostToDevice,
    }
}

/// One-sided operation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Read,
    Write,
}

/// A single `(local, remote, len)` transfer descriptor.
#[derive(Debug, Clone, Copy)]
pub struct TransferOpDesc {
    pub local_addr: u64,
    pub remote_addr: u64,
    pub len: u64,
}

/// The interface every wire transport implements: channel lifecycle, memory
/// (de)registration on that channel, one-sided data movement, and a fence.
///
/// Method names mirror `original_source/src/hixl/cs/hixl_cs_client.h`
/// (`RegMem`/`Import`/one-sided ops) translated into the async-trait idiom
/// the teacher uses for `IpcTransport`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn comm_type(&self) -> CommType;

    /// Registers a local region with this transport so it can be a source
    /// or destination of one-sided ops (§4.5.2).
    async fn register_mem(&self, addr: u64, len: u64) -> Result<()>;
    async fn unregister_mem(&self, addr: u64) -> Result<()>;

    /// One-sided read: copies `len` bytes from `remote_addr` (on the peer)
    /// into `local_addr` (ours).
    async fn read(&self, local_addr: u64, remote_addr: u64, len: u64) -> Result<()>;

    /// One-sided write: copies `len` bytes from `local_addr` (ours) into
    /// `remote_addr` (on the peer).
    async fn write(&self, local_addr: u64, remote_addr: u64, len: u64) -> Result<()>;

    /// Fences all previously-issued ops on this transport instance.
    async fn fence(&self) -> Result<()>;
}

/// Maps each negotiated `CommType` to the transport instance carrying it —
/// the Rust form of the "table from CommType to transport instance" the
/// spec calls for.
#[derive(Default)]
pub struct TransportTable {
    transports: HashMap<CommType, Arc<dyn Transport>>,
}

impl TransportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.comm_type(), transport);
    }

    pub fn get(&self, comm_type: CommType) -> Option<Arc<dyn Transport>> {
        self.transports.get(&comm_type).cloned()
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.values()
    }

    pub fn contains(&self, comm_type: CommType) -> bool {
        self.transports.contains_key(&comm_type)
    }

    pub fn has_roce(&self) -> bool {
        self.contains(CommType::Roce)
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}
