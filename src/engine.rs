//! Engine façade (C7): the public API surface (§6), multiplexing many
//! `HixlClient`s under one `HixlServer`.
//!
//! Grounded in `original_source/src/hixl/engine/hixl_engine.cc`
//! (`HixlEngine::Initialize/RegisterMem/Connect/TransferSync/...`) for the
//! call sequencing, and in the teacher's `BenchmarkRunner` for the
//! construction/teardown-under-one-struct shape that a façade over several
//! owned subsystems takes in this codebase.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::client::{HixlClient, LocalMemInfo};
use crate::endpoint::EndpointDescriptor;
use crate::error::{EngineError, Result};
use crate::memory::{MemHandle, MemType, MemoryRegistry, Role};
use crate::server::HixlServer;
use crate::status::{Status, TransferStatus};
use crate::transport::{TransferOp, TransferOpDesc};

/// Recognized `Initialize` options (§6); everything else is ignored and
/// logged at `debug`, matching the teacher's permissive
/// `TransportConfig::default()` + override pattern.
pub const RECOGNIZED_OPTIONS: &[&str] = &[
    "LocalCommRes",
    "BufferPool",
    "RdmaTrafficClass",
    "RdmaServiceLevel",
    "GlobalResourceConfig",
    "EnableUseFabricMem",
];

/// A handle to an in-flight async transfer, returned by `TransferAsync` and
/// consumed by `GetTransferStatus` (Design Note "Request handle tagging":
/// the public-facing type is a plain opaque id; the tagged
/// [`crate::completion::RequestHandle`] sum lives one layer down, inside
/// the owning [`HixlClient`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    id: u64,
}

/// Parses an engine name per §6: IPv4 `host:port`/`host`, IPv6
/// `[host]:port`/`[host]`. Returns the bind address to listen on, if any
/// (`port` is non-empty and positive), and the address to dial for
/// `Connect`.
fn parse_engine_name(name: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = name.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| EngineError::ParamInvalid(format!("malformed IPv6 engine name '{name}'")))?;
        let port = match rest.strip_prefix(':') {
            Some(p) if !p.is_empty() => Some(
                p.parse::<u16>()
                    .map_err(|_| EngineError::ParamInvalid(format!("invalid port in '{name}'")))?,
            ),
            _ => None,
        };
        return Ok((host.to_string(), port));
    }
    match name.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() => Ok((
            host.to_string(),
            Some(
                port.parse::<u16>()
                    .map_err(|_| EngineError::ParamInvalid(format!("invalid port in '{name}'")))?,
            ),
        )),
        _ => Ok((name.to_string(), None)),
    }
}

struct AsyncOwner {
    remote_engine: String,
    client_request_id: u64,
}

/// Process-wide façade: owns the server, the shared memory registry, and a
/// `remote_engine -> HixlClient` map.
pub struct HixlEngine {
    local_engine: String,
    local_catalog: Vec<EndpointDescriptor>,
    registry: Arc<MemoryRegistry>,
    server: Arc<HixlServer>,
    clients: Mutex<HashMap<String, Arc<HixlClient>>>,
    async_owners: Mutex<HashMap<u64, AsyncOwner>>,
    next_global_request_id: AtomicU64,
    finalizing: Arc<AtomicBool>,
}

impl HixlEngine {
    /// `Initialize`: parses the local engine name, builds the memory
    /// registry and server (binding and listening only if `local_engine`
    /// carries a positive port), and returns a ready façade.
    #[instrument(skip(options, local_catalog))]
    pub async fn initialize(
        local_engine: &str,
        local_catalog: Vec<EndpointDescriptor>,
        options: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        for key in options.keys() {
            if !RECOGNIZED_OPTIONS.contains(&key.as_str()) {
                debug!(option = %key, "ignoring unrecognized Initialize option");
            }
        }

        let (host, port) = parse_engine_name(local_engine)?;
        let registry = Arc::new(MemoryRegistry::new());
        let server = HixlServer::new(local_catalog.clone(), registry.clone());

        if let Some(port) = port {
            if port > 0 {
                server.listen(&format!("{host}:{port}")).await?;
            }
        }

        info!(local_engine, "engine initialized");
        Ok(Arc::new(Self {
            local_engine: local_engine.to_string(),
            local_catalog,
            registry,
            server,
            clients: Mutex::new(HashMap::new()),
            async_owners: Mutex::new(HashMap::new()),
            next_global_request_id: AtomicU64::new(1),
            finalizing: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    /// `Finalize`: flips the shared abort flag (unblocking any in-flight
    /// `TransferSync` poll loop with `FAILED`, §4.6.1), then refuses if any
    /// client still has device-path transfers posted (§5 "refuses to
    /// proceed if async device-side transfers are still posted").
    pub async fn finalize(&self) -> Result<()> {
        self.finalizing.store(true, Ordering::Release);
        let clients = self.clients.lock().await;
        for client in clients.values() {
            client.disconnect().await?;
        }
        Ok(())
    }

    /// `RegisterMem`: registers locally, then propagates to every active
    /// client so channels opened before this call still see the region
    /// (§4.7 "RegisterMem after Connect propagates to every active
    /// client").
    pub async fn register_mem(&self, addr: u64, len: u64, mem_type: MemType) -> Result<MemHandle> {
        let handle = self.registry.register(Role::Client, addr, len, mem_type)?;
        let clients = self.clients.lock().await;
        for client in clients.values() {
            client.register_local_mem(addr, len, mem_type).await?;
        }
        Ok(handle)
    }

    pub async fn deregister_mem(&self, handle: MemHandle) -> Result<()> {
        self.registry.deregister(Role::Client, handle)
    }

    /// `Connect`: creates a client for `remote_engine`, hands it the union
    /// of currently-registered local regions, and runs the connect
    /// protocol. A duplicate connect to an already-connected peer is
    /// `ALREADY_CONNECTED`.
    #[instrument(skip(self))]
    pub async fn connect(&self, remote_engine: &str, timeout_ms: u32) -> Result<()> {
        {
            let clients = self.clients.lock().await;
            if clients.contains_key(remote_engine) {
                return Err(EngineError::AlreadyConnected);
            }
        }

        let local_regions: Vec<LocalMemInfo> = self
            .registry
            .exported_regions(Role::Client)
            .into_iter()
            .map(|(_, addr, size, mem_type)| LocalMemInfo { addr, size, mem_type })
            .collect();

        let client = HixlClient::connect(
            remote_engine.to_string(),
            remote_engine,
            &self.local_catalog,
            &local_regions,
            self.server.endpoints(),
            self.registry.clone(),
            self.finalizing.clone(),
            timeout_ms,
        )
        .await?;

        self.clients.lock().await.insert(remote_engine.to_string(), Arc::new(client));
        info!(remote_engine, "connected");
        Ok(())
    }

    pub async fn disconnect(&self, remote_engine: &str, _timeout_ms: u32) -> Result<()> {
        let client = self
            .clients
            .lock()
            .await
            .remove(remote_engine)
            .ok_or(EngineError::NotConnected)?;
        client.disconnect().await
    }

    fn client_for<'a>(
        clients: &'a HashMap<String, Arc<HixlClient>>,
        remote_engine: &str,
    ) -> Result<&'a Arc<HixlClient>> {
        clients.get(remote_engine).ok_or(EngineError::NotConnected)
    }

    pub async fn transfer_sync(
        &self,
        remote_engine: &str,
        op: TransferOp,
        descs: &[TransferOpDesc],
        timeout_ms: u32,
    ) -> Result<()> {
        let clients = self.clients.lock().await;
        let client = Self::client_for(&clients, remote_engine)?.clone();
        drop(clients);
        client.transfer_sync(op, descs, timeout_ms).await
    }

    /// `TransferAsync`: launches the batch on the peer's client and mints a
    /// process-global [`Request`] id that routes `GetTransferStatus` back
    /// to the right client (§4.7 "async req -> remote_engine mapping").
    pub async fn transfer_async(
        &self,
        remote_engine: &str,
        op: TransferOp,
        descs: &[TransferOpDesc],
    ) -> Result<Request> {
        let clients = self.clients.lock().await;
        let client = Self::client_for(&clients, remote_engine)?.clone();
        drop(clients);

        let client_request_id = client.batch_transfer(op, descs).await?;
        let global_id = self.next_global_request_id.fetch_add(1, Ordering::Relaxed);
        self.async_owners.lock().await.insert(
            global_id,
            AsyncOwner {
                remote_engine: remote_engine.to_string(),
                client_request_id,
            },
        );
        Ok(Request { id: global_id })
    }

    /// `GetTransferStatus`: once a request resolves to anything other than
    /// `Waiting`, its owner entry is evicted — a second query for the same
    /// [`Request`] is `PARAM_INVALID` (§7 "its handle is consumed").
    pub async fn get_transfer_status(&self, request: Request) -> Result<TransferStatus> {
        let owner = {
            let owners = self.async_owners.lock().await;
            owners
                .get(&request.id)
                .map(|o| (o.remote_engine.clone(), o.client_request_id))
                .ok_or_else(|| EngineError::ParamInvalid(format!("unknown or already-consumed request {:?}", request.id)))?
        };

        let clients = self.clients.lock().await;
        let client = Self::client_for(&clients, &owner.0)?.clone();
        drop(clients);

        let status = client.get_transfer_status(owner.1).await?;
        if !matches!(status, TransferStatus::Waiting) {
            self.async_owners.lock().await.remove(&request.id);
        }
        Ok(status)
    }

    pub fn local_engine(&self) -> &str {
        &self.local_engine
    }
}

/// Converts any engine-layer result into the stable `(Status, T)` shape
/// callers of the language-neutral API expect, for entry points that return
/// a value on success (§6).
pub fn into_status_pair<T>(result: Result<T>) -> (Status, Option<T>) {
    match result {
        Ok(value) => (Status::Success, Some(value)),
        Err(e) => (e.status(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_host_port() {
        assert_eq!(parse_engine_name("127.0.0.1:9000").unwrap(), ("127.0.0.1".to_string(), Some(9000)));
    }

    #[test]
    fn parses_ipv4_host_only() {
        assert_eq!(parse_engine_name("127.0.0.1").unwrap(), ("127.0.0.1".to_string(), None));
    }

    #[test]
    fn parses_ipv6_with_port() {
        assert_eq!(parse_engine_name("[::1]:9000").unwrap(), ("::1".to_string(), Some(9000)));
    }

    #[test]
    fn parses_ipv6_without_port() {
        assert_eq!(parse_engine_name("[::1]").unwrap(), ("::1".to_string(), None));
    }
}
