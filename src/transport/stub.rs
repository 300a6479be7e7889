//! Seam for a real hardware-backed transport.
//!
//! §1 places "the concrete wire implementation of each transport
//! (HCCS/RoCE/UB-CTP/UB-TP drivers)" out of scope, surfaced as opaque
//! channel/thread/export handles. This module is that seam made concrete:
//! a transport that type-checks against [`Transport`] and can be wired into
//! a [`super::TransportTable`] exactly like [`super::loopback::LoopbackTransport`],
//! but whose data-path methods return `Status::Unsupported` rather than
//! silently doing nothing. A real driver binding lives here, behind the
//! same trait, without touching the engine above it.

use super::{CommType, Transport};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use tracing::warn;

pub struct DriverStubTransport {
    comm_type: CommType,
}

impl DriverStubTransport {
    pub fn new(comm_type: CommType) -> Self {
        warn!(
            comm_type = %comm_type,
            "constructing a hardware transport stub; data-path calls will return Unsupported"
        );
        Self { comm_type }
    }

    fn unsupported(&self, op: &str) -> EngineError {
        EngineError::Unsupported(format!(
            "{op} on {} requires a real driver binding, which this build does not carry",
            self.comm_type
        ))
    }
}

#[async_trait]
impl Transport for DriverStubTransport {
    fn comm_type(&self) -> CommType {
        self.comm_type
    }

    async fn register_mem(&self, _addr: u64, _len: u64) -> Result<()> {
        Err(self.unsupported("register_mem"))
    }

    async fn unregister_mem(&self, _addr: u64) -> Result<()> {
        Err(self.unsupported("unregister_mem"))
    }

    async fn read(&self, _local_addr: u64, _remote_addr: u64, _len: u64) -> Result<()> {
        Err(self.unsupported("read"))
    }

    async fn write(&self, _local_addr: u64, _remote_addr: u64, _len: u64) -> Result<()> {
        Err(self.unsupported("write"))
    }

    async fn fence(&self) -> Result<()> {
        Err(self.unsupported("fence"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_path_is_unsupported() {
        let transport = DriverStubTransport::new(CommType::UbDeviceToDevice);
        assert!(matches!(
            transport.read(0, 0, 4).await,
            Err(EngineError::Unsupported(_))
        ));
    }
}
