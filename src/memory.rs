//! Memory registry (C3): per-process bookkeeping of registered regions.
//!
//! Grounded in `original_source/src/hixl/cs/hixl_mem_store.h` (`HixlMemStore`):
//! two disjoint maps (`server_regions`, `client_regions`), overlap detection
//! against both map neighbors, and idempotent re-registration of an identical
//! range.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Whether a region lives in host-addressable memory or device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    Host,
    Device,
}

/// Opaque handle returned to callers of `RegisterMem`.
///
/// Identical to the region's starting address; callers must treat it as
/// opaque, but keying it on `addr` is what gives I-3 (re-registering the
/// same range returns the same handle) for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemHandle(pub u64);

/// Which side of the registry a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Regions this process publishes to peers (exported).
    Server,
    /// Regions this process uses as local transfer buffers, including
    /// imported views of a peer's memory.
    Client,
}

#[derive(Debug, Clone)]
struct Region {
    addr: u64,
    size: u64,
    mem_type: MemType,
}

impl Region {
    fn end(&self) -> u64 {
        self.addr + self.size
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr && addr + len <= self.end()
    }
}

#[derive(Default)]
struct RegionMap {
    regions: BTreeMap<u64, Region>,
}

impl RegionMap {
    /// Returns `true` if `[addr, addr+size)` overlaps any existing region
    /// other than an identical re-registration.
    fn overlaps(&self, addr: u64, size: u64) -> bool {
        let end = addr + size;
        // Predecessor: the region with the greatest start <= addr.
        if let Some((_, pred)) = self.regions.range(..=addr).next_back() {
            if pred.addr != addr && pred.end() > addr {
                return true;
            }
        }
        // Successor: the region with the smallest start > addr.
        if let Some((_, succ)) = self.regions.range((addr + 1)..).next() {
            if succ.addr < end {
                return true;
            }
        }
        false
    }

    fn find_containing(&self, addr: u64, len: u64) -> bool {
        // A containing region must start at or before addr; walk backward
        // from the first candidate since ranges never overlap once inserted.
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region.contains(addr, len))
            .unwrap_or(false)
    }
}

/// Tracks registered regions for one process, split by role, guarded by a
/// single mutex (the map is tiny — hundreds of entries at most — so a
/// synchronous `Mutex` is the right tool; no `.await` point is ever reached
/// while it is held).
pub struct MemoryRegistry {
    server: Mutex<RegionMap>,
    client: Mutex<RegionMap>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            server: Mutex::new(RegionMap::default()),
            client: Mutex::new(RegionMap::default()),
        }
    }

    fn map_for(&self, role: Role) -> &Mutex<RegionMap> {
        match role {
            Role::Server => &self.server,
            Role::Client => &self.client,
        }
    }

    /// Registers `[addr, addr+size)` of `mem_type` under `role`.
    ///
    /// Idempotent: re-registering the exact same `(addr, size, mem_type)`
    /// succeeds and returns the same handle (I-3); any other overlap is
    /// `PARAM_INVALID` (I-1).
    pub fn register(&self, role: Role, addr: u64, size: u64, mem_type: MemType) -> Result<MemHandle> {
        if size == 0 {
            return Err(EngineError::ParamInvalid("zero-length region".into()));
        }
        let mut map = self.map_for(role).lock().expect("memory registry poisoned");
        if let Some(existing) = map.regions.get(&addr) {
            if existing.size == size && existing.mem_type == mem_type {
                return Ok(MemHandle(addr));
            }
            return Err(EngineError::ParamInvalid(format!(
                "region at {addr:#x} already registered with different size/type"
            )));
        }
        if map.overlaps(addr, size) {
            return Err(EngineError::ParamInvalid(format!(
                "region [{addr:#x}, {:#x}) overlaps an existing registration",
                addr + size
            )));
        }
        map.regions.insert(
            addr,
            Region {
                addr,
                size,
                mem_type,
            },
        );
        Ok(MemHandle(addr))
    }

    /// Deregisters a handle. Unknown handles are treated as a no-op success,
    /// matching the spec's invariant list.
    pub fn deregister(&self, role: Role, handle: MemHandle) -> Result<()> {
        let mut map = self.map_for(role).lock().expect("memory registry poisoned");
        map.regions.remove(&handle.0);
        Ok(())
    }

    /// Looks up the memory type of the region containing `[addr, addr+len)`,
    /// used by the router's classification step (C6).
    pub fn mem_type_of(&self, role: Role, addr: u64, len: u64) -> Result<MemType> {
        let map = self.map_for(role).lock().expect("memory registry poisoned");
        map.regions
            .range(..=addr)
            .next_back()
            .filter(|(_, region)| region.contains(addr, len))
            .map(|(_, region)| region.mem_type)
            .ok_or_else(|| EngineError::ParamInvalid(format!("address {addr:#x} not registered")))
    }

    /// `ValidateMemoryAccess`: the remote range must be fully covered by a
    /// server region and the local range by a client region.
    pub fn validate_access(&self, remote_addr: u64, len: u64, local_addr: u64) -> Result<()> {
        let server_ok = self
            .server
            .lock()
            .expect("memory registry poisoned")
            .find_containing(remote_addr, len);
        let client_ok = self
            .client
            .lock()
            .expect("memory registry poisoned")
            .find_containing(local_addr, len);
        if server_ok && client_ok {
            Ok(())
        } else {
            Err(EngineError::ParamInvalid(
                "transfer range not covered by a registered region".into(),
            ))
        }
    }

    /// Snapshot of every region registered under `role`, used when
    /// exporting this process's own memory to a peer (`Role::Client`, the
    /// map `RegisterMem` populates) or for diagnostics.
    pub fn exported_regions(&self, role: Role) -> Vec<(MemHandle, u64, u64, MemType)> {
        self.map_for(role)
            .lock()
            .expect("memory registry poisoned")
            .regions
            .values()
            .map(|r| (MemHandle(r.addr), r.addr, r.size, r.mem_type))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_reregister_is_idempotent() {
        let registry = MemoryRegistry::new();
        let h1 = registry.register(Role::Server, 0x1000, 0x100, MemType::Host).unwrap();
        let h2 = registry.register(Role::Server, 0x1000, 0x100, MemType::Host).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn overlap_is_rejected_but_adjacency_is_allowed() {
        let registry = MemoryRegistry::new();
        registry.register(Role::Server, 0x1000, 0x100, MemType::Host).unwrap();
        assert!(registry
            .register(Role::Server, 0x1080, 0x100, MemType::Host)
            .is_err());
        assert!(registry
            .register(Role::Server, 0x1100, 0x100, MemType::Host)
            .is_ok());
    }

    #[test]
    fn zero_length_region_is_rejected() {
        let registry = MemoryRegistry::new();
        assert!(registry.register(Role::Client, 0x2000, 0, MemType::Device).is_err());
    }

    #[test]
    fn validate_access_requires_both_sides_registered() {
        let registry = MemoryRegistry::new();
        registry.register(Role::Server, 0x1000, 0x100, MemType::Host).unwrap();
        registry.register(Role::Client, 0x2000, 0x100, MemType::Device).unwrap();
        assert!(registry.validate_access(0x1000, 0x10, 0x2000).is_ok());
        assert!(registry.validate_access(0x1000, 0x10, 0x3000).is_err());
    }

    #[test]
    fn deregistering_unknown_handle_is_a_no_op() {
        let registry = MemoryRegistry::new();
        assert!(registry.deregister(Role::Server, MemHandle(0xdead)).is_ok());
    }
}
