//! The one fully-working [`Transport`]: moves bytes directly between two
//! registered regions in the same address space.
//!
//! Every `addr` the engine's public API accepts is a real pointer value
//! (typically `Vec<u8>::as_mut_ptr() as u64`) into memory the caller keeps
//! alive for the lifetime of the registration — exactly the semantics a
//! real RDMA/UB transport has toward locally-registered memory, where a
//! peer's one-sided op writes directly into your process. This transport
//! makes that literal instead of routing it through a real NIC, which is
//! what makes the engine runnable and testable on a single host without
//! hardware (§1, §4.11). The teacher's `ipc/shared_memory.rs` takes the
//! same approach for its ring buffer (`data_ptr()` plus raw byte-copy
//! loops); this module is the same idiom applied to one-sided RDMA-style
//! copies instead of a producer/consumer ring.

use super::{CommType, Transport};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::Mutex;

pub struct LoopbackTransport {
    comm_type: CommType,
    registered: Mutex<HashSet<u64>>,
}

impl LoopbackTransport {
    pub fn new(comm_type: CommType) -> Self {
        Self {
            comm_type,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// # Safety
    /// `local_addr` and `remote_addr` must each point at least `len` bytes
    /// of memory the corresponding registration's caller still owns. This
    /// is the same obligation a real one-sided RDMA write places on the
    /// registering process: the engine cannot see past the raw address it
    /// was handed.
    unsafe fn copy(len: u64, src_addr: u64, dst_addr: u64) {
        if len == 0 {
            return;
        }
        std::ptr::copy(src_addr as *const u8, dst_addr as *mut u8, len as usize);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn comm_type(&self) -> CommType {
        self.comm_type
    }

    async fn register_mem(&self, addr: u64, _len: u64) -> Result<()> {
        self.registered.lock().await.insert(addr);
        Ok(())
    }

    async fn unregister_mem(&self, addr: u64) -> Result<()> {
        self.registered.lock().await.remove(&addr);
        Ok(())
    }

    async fn read(&self, local_addr: u64, remote_addr: u64, len: u64) -> Result<()> {
        // SAFETY: see the module-level and `copy` safety notes; callers
        // reach this only through `RegisterMem`-validated addresses
        // (C3's `validate_access`, enforced by the router before dispatch).
        unsafe { Self::copy(len, remote_addr, local_addr) };
        Ok(())
    }

    async fn write(&self, local_addr: u64, remote_addr: u64, len: u64) -> Result<()> {
        // SAFETY: see `read` above.
        unsafe { Self::copy(len, local_addr, remote_addr) };
        Ok(())
    }

    async fn fence(&self) -> Result<()> {
        // Loopback copies are synchronous; by the time `read`/`write`
        // returned, the data already landed, so there is nothing to wait
        // for here beyond a no-op memory fence.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_moves_bytes() {
        let transport = LoopbackTransport::new(CommType::Roce);
        let mut src = vec![0u8; 4];
        src.copy_from_slice(&2i32.to_le_bytes());
        let mut dst = vec![0u8; 4];

        let src_addr = src.as_ptr() as u64;
        let dst_addr = dst.as_mut_ptr() as u64;

        transport.write(src_addr, dst_addr, 4).await.unwrap();
        assert_eq!(i32::from_le_bytes(dst[..].try_into().unwrap()), 2);
    }
}
