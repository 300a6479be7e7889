//! Client (C5): for one peer, runs the connect protocol (TCP connect, fetch
//! catalog, pair endpoints, create channels, wait for readiness, import
//! regions, populate segment tables) and serves as the local half of the
//! transfer router (C6) once connected.
//!
//! Grounded in `original_source/src/hixl/engine/hixl_client.cc`
//! (`HixlClient::Connect`) for the ordered protocol and in
//! `original_source/src/hixl/engine/hixl_client.cc`'s
//! `MustUseRoce`/`TryMatchRoceEndpoints`/`BuildEndpointsMatchMap`/
//! `TryMatchUbEndpoints` for the endpoint-pairing algorithm (§4.5.1). The
//! TCP connect-with-retry and socket configuration follow the teacher's
//! `ipc/tcp_socket.rs` `start_client`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::codec::{self, CreateChannelReq, GetRemoteMemReq, GetRemoteMemResp, MsgType};
use crate::completion::{CompletionPool, LegacyFlagQueue, RequestHandle};
use crate::endpoint::{Endpoint, EndpointDescriptor, Placement, Protocol};
use crate::error::{EngineError, Result};
use crate::memory::{MemHandle, MemType, MemoryRegistry, Role};
use crate::segment::SegmentTable;
use crate::status::TransferStatus;
use crate::transport::loopback::LoopbackTransport;
use crate::transport::{CommType, Transport, TransferOp, TransferOpDesc, TransportTable};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(1);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// One negotiated (local endpoint, remote endpoint, transport class) pairing
/// produced by §4.5.1, before a channel has actually been created for it.
struct Pairing {
    comm_type: CommType,
    local: EndpointDescriptor,
    remote: EndpointDescriptor,
}

/// `MustUseRoce`: forced RoCE when the env var is set or the two sides'
/// superpod tags (`net_instance_id`) disagree, compared only at index 0 of
/// each list (matching the original's non-exhaustive comparison).
fn must_use_roce(local: &[EndpointDescriptor], remote: &[EndpointDescriptor]) -> bool {
    if std::env::var("HCCL_INTRA_ROCE_ENABLE").as_deref() == Ok("1") {
        return true;
    }
    match (local.first(), remote.first()) {
        (Some(l), Some(r)) => l.net_instance_id != r.net_instance_id,
        _ => false,
    }
}

fn try_match_roce(local: &[EndpointDescriptor], remote: &[EndpointDescriptor]) -> Result<Pairing> {
    let l = local
        .iter()
        .find(|d| d.protocol == Protocol::Roce)
        .ok_or_else(|| EngineError::ParamInvalid("no local RoCE endpoint to pair".into()))?;
    let r = remote
        .iter()
        .find(|d| d.protocol == Protocol::Roce)
        .ok_or_else(|| EngineError::ParamInvalid("no remote RoCE endpoint to pair".into()))?;
    Ok(Pairing {
        comm_type: CommType::Roce,
        local: l.clone(),
        remote: r.clone(),
    })
}

/// `BuildEndpointsMatchMap` + `TryMatchUbEndpoints`: a fuzzy linear-scan
/// match over UB-protocol remote entries keyed by `(dst_eid, plane,
/// placement)`, tried against both placements for each local UB entry.
fn try_match_ub(local: &[EndpointDescriptor], remote: &[EndpointDescriptor]) -> Vec<Pairing> {
    let ub_remote: Vec<&EndpointDescriptor> = remote.iter().filter(|d| d.protocol.is_ub()).collect();
    let mut used: HashSet<CommType> = HashSet::new();
    let mut pairings = Vec::new();

    'outer: for l in local.iter().filter(|d| d.protocol.is_ub()) {
        for placement in [Placement::Device, Placement::Host] {
            if let Some(r) = ub_remote.iter().find(|r| ub_key_matches(l, placement, r)) {
                let comm_type = crate::transport::parse_comm_type(l.placement, r.placement);
                if used.insert(comm_type) {
                    pairings.push(Pairing {
                        comm_type,
                        local: l.clone(),
                        remote: (*r).clone(),
                    });
                    if used.len() == 4 {
                        break 'outer;
                    }
                }
            }
        }
    }
    pairings
}

/// A query `(l.comm_id, l.plane, placement)` matches a catalog entry `r`
/// iff `plane` and `placement` are equal, and `dst_eid` is equal only when
/// *both* sides specify a non-empty value — an absent value on either side
/// matches any.
fn ub_key_matches(l: &EndpointDescriptor, placement: Placement, r: &&EndpointDescriptor) -> bool {
    if r.placement != placement || r.plane != l.plane {
        return false;
    }
    match (&l.comm_id, &r.dst_eid) {
        (a, Some(b)) if !a.is_empty() && !b.is_empty() => a == b,
        _ => true,
    }
}

/// §4.5.1: the full decision tree. Returns every channel to create; the
/// caller fails `Connect` if this returns empty.
fn pair_endpoints(local: &[EndpointDescriptor], remote: &[EndpointDescriptor]) -> Result<Vec<Pairing>> {
    if must_use_roce(local, remote) {
        return Ok(vec![try_match_roce(local, remote)?]);
    }
    let pairings = try_match_ub(local, remote);
    if pairings.is_empty() {
        return Err(EngineError::Failed(
            "endpoint pairing produced no usable channel".into(),
        ));
    }
    Ok(pairings)
}

fn placement_of(mem_type: MemType) -> Placement {
    match mem_type {
        MemType::Host => Placement::Host,
        MemType::Device => Placement::Device,
    }
}

/// §4.5.2: which transport classes a region of a given type must be
/// registered on so every channel that could carry it has a valid
/// registration.
fn transports_for_mem_type(mem_type: MemType) -> &'static [CommType] {
    match mem_type {
        MemType::Device => &[CommType::UbDeviceToHost, CommType::UbDeviceToDevice, CommType::Roce],
        MemType::Host => &[CommType::UbHostToDevice, CommType::UbHostToHost, CommType::Roce],
    }
}

/// A local region registered on this engine, passed to every client at
/// construction time (`SetLocalMemInfo`, §4.5 step 6 / §4.5.2).
#[derive(Debug, Clone, Copy)]
pub struct LocalMemInfo {
    pub addr: u64,
    pub size: u64,
    pub mem_type: MemType,
}

/// One outstanding `batch_transfer` call: the primary handle returned to
/// the caller plus any other per-bucket handles the router must also poll
/// (§4.6 "the router remembers the other completion handles... so
/// `get_transfer_status` can AND-reduce their states").
struct PendingRequest {
    handles: Vec<RequestHandle>,
}

/// The client half of one peer connection: owns the negotiated transports,
/// the imported view of the peer's memory, and the completion resources
/// backing in-flight transfers toward this peer.
pub struct HixlClient {
    remote_engine: String,
    registry: Arc<MemoryRegistry>,
    transports: TransportTable,
    local_segments: Mutex<SegmentTable>,
    remote_segments: Mutex<SegmentTable>,
    imported_handles: Vec<MemHandle>,
    completion_pool: CompletionPool,
    legacy_queue: LegacyFlagQueue,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
    finalizing: Arc<AtomicBool>,
}

impl HixlClient {
    /// Runs the full connect protocol against `remote_addr` and returns a
    /// ready-to-use client, or an error if any step fails. On partial
    /// failure during region import, already-imported regions are rolled
    /// back (§7 "importing a subset of peer regions and failing midway
    /// closes already-imported views").
    #[instrument(skip(local_catalog, local_regions, endpoints, registry, finalizing), fields(remote = %remote_addr))]
    pub async fn connect(
        remote_engine: String,
        remote_addr: &str,
        local_catalog: &[EndpointDescriptor],
        local_regions: &[LocalMemInfo],
        endpoints: Arc<Mutex<HashMap<u64, Arc<Endpoint>>>>,
        registry: Arc<MemoryRegistry>,
        finalizing: Arc<AtomicBool>,
        timeout_ms: u32,
    ) -> Result<Self> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);

        let mut stream = connect_with_retry(remote_addr, deadline).await?;
        let remaining = |d: Instant| d.saturating_duration_since(Instant::now()).max(Duration::from_millis(1));

        // Step 2: fetch the peer's catalog.
        codec::write_message(&mut stream, MsgType::GetEndPointInfoReq, &[], remaining(deadline)).await?;
        let (msg_type, body) = codec::read_message(&mut stream, remaining(deadline)).await?;
        if msg_type != MsgType::GetEndPointInfoResp {
            return Err(EngineError::Failed(format!("unexpected reply {msg_type:?} to catalog fetch")));
        }
        let remote_wire: Vec<crate::codec::EndpointDescriptorWire> = codec::decode_json(&body)?;
        let remote_catalog: Vec<EndpointDescriptor> = remote_wire
            .iter()
            .map(EndpointDescriptor::from_wire)
            .collect::<Result<_>>()?;

        // Step 3: pair endpoints and create one channel per pairing.
        let pairings = pair_endpoints(local_catalog, &remote_catalog)?;
        let mut transports = TransportTable::new();
        let mut local_channels: Vec<(u64, u64)> = Vec::new(); // (local_endpoint_handle, channel_handle)

        for pairing in &pairings {
            codec::write_message(
                &mut stream,
                MsgType::CreateChannelReq,
                &codec::encode_struct(&CreateChannelReq {
                    src: pairing.local.to_wire(),
                })?,
                remaining(deadline),
            )
            .await?;
            let (msg_type, body) = codec::read_message(&mut stream, remaining(deadline)).await?;
            if msg_type != MsgType::CreateChannelResp {
                return Err(EngineError::Failed(format!(
                    "unexpected reply {msg_type:?} to create-channel"
                )));
            }
            let resp: crate::codec::CreateChannelResp = codec::decode_struct(&body)?;
            if resp.result != crate::status::Status::Success.code() as u32 {
                warn!(comm_type = %pairing.comm_type, "peer rejected channel creation, skipping pairing");
                continue;
            }

            let local_endpoint = find_local_endpoint(&endpoints, &pairing.local).await.ok_or_else(|| {
                EngineError::Failed("paired local endpoint vanished from endpoint map".into())
            })?;
            let channel = local_endpoint.create_channel(resp.dst_endpoint_handle).await;
            local_channels.push((local_endpoint.handle, channel.handle));
            transports.insert(Arc::new(LoopbackTransport::new(pairing.comm_type)));
        }

        if transports.is_empty() {
            return Err(EngineError::Failed("no channel survived negotiation".into()));
        }

        // Step 4: wait for every created channel to report Ready.
        wait_for_readiness(&endpoints, &local_channels, deadline).await?;

        // §4.5.2: register every local region on each transport that could
        // carry it.
        let mut local_segments = SegmentTable::new();
        for region in local_regions {
            local_segments.add(region.mem_type, region.addr, region.addr + region.size);
            for &comm_type in transports_for_mem_type(region.mem_type) {
                if let Some(transport) = transports.get(comm_type) {
                    transport.register_mem(region.addr, region.size).await?;
                }
            }
        }

        // Step 5 + 6: import the peer's exported regions and populate the
        // remote segment table, rolling back on partial failure.
        let (remote_segments, imported_handles) = match import_peer_regions(&mut stream, &registry, deadline).await
        {
            Ok(result) => result,
            Err(e) => {
                for comm_type_transport in transports.values() {
                    let _ = comm_type_transport.fence().await;
                }
                return Err(e);
            }
        };

        info!(channels = transports.len(), "client connected");

        Ok(Self {
            remote_engine,
            registry,
            transports,
            local_segments: Mutex::new(local_segments),
            remote_segments: Mutex::new(remote_segments),
            imported_handles,
            completion_pool: CompletionPool::new(),
            legacy_queue: LegacyFlagQueue::new(),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            finalizing,
        })
    }

    pub fn remote_engine(&self) -> &str {
        &self.remote_engine
    }

    /// Propagates a `RegisterMem` that happened after `connect` to this
    /// already-open peer connection (§4.7 "RegisterMem after Connect
    /// propagates to every active client"): adds the region to the local
    /// segment table and registers it on every transport that could carry
    /// it (§4.5.2), the same matrix `connect` applies to the regions it
    /// started with.
    pub async fn register_local_mem(&self, addr: u64, size: u64, mem_type: MemType) -> Result<()> {
        self.local_segments.lock().await.add(mem_type, addr, addr + size);
        for &comm_type in transports_for_mem_type(mem_type) {
            if let Some(transport) = self.transports.get(comm_type) {
                transport.register_mem(addr, size).await?;
            }
        }
        Ok(())
    }

    /// Unwinds everything `connect` built: deregisters imported peer
    /// regions. A `Destroy` while any device slot is still `Posted` is an
    /// error (§4.6 state machine); the caller must drain first.
    pub async fn disconnect(&self) -> Result<()> {
        if self.completion_pool.in_use_count().await > 0 {
            return Err(EngineError::Failed(
                "disconnect while a device-path transfer is still posted".into(),
            ));
        }
        for handle in &self.imported_handles {
            self.registry.deregister(Role::Server, *handle)?;
        }
        Ok(())
    }

    /// `batch_transfer`: validates, classifies, dispatches, and returns the
    /// primary [`Request`](crate::transfer::Request) id. See C6 in
    /// `SPEC_FULL.md` for the full algorithm this implements.
    pub async fn batch_transfer(&self, op: TransferOp, descs: &[TransferOpDesc]) -> Result<u64> {
        if descs.is_empty() {
            return Err(EngineError::ParamInvalid("batch_transfer with no descriptors".into()));
        }
        for desc in descs {
            self.registry
                .validate_access(desc.remote_addr, desc.len, desc.local_addr)?;
        }

        let buckets = self.classify(descs).await?;
        let mut bucket_handles = Vec::with_capacity(buckets.len());
        for (comm_type, bucket) in buckets {
            let transport = self
                .transports
                .get(comm_type)
                .ok_or_else(|| EngineError::NotConnected)?;
            let handle = self.dispatch_bucket(transport, op, bucket).await?;
            bucket_handles.push(handle);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().await.insert(
            id,
            PendingRequest {
                handles: bucket_handles,
            },
        );
        Ok(id)
    }

    /// Classifies each descriptor by the comm type that must carry it
    /// (§4.6 "Classification"), preserving first-seen bucket order so the
    /// caller's "first bucket" rule is deterministic.
    async fn classify(&self, descs: &[TransferOpDesc]) -> Result<Vec<(CommType, Vec<TransferOpDesc>)>> {
        let mut order: Vec<CommType> = Vec::new();
        let mut buckets: HashMap<CommType, Vec<TransferOpDesc>> = HashMap::new();

        let has_roce = self.transports.has_roce();
        for &desc in descs {
            let comm_type = if has_roce {
                CommType::Roce
            } else {
                let local_type = self
                    .local_segments
                    .lock()
                    .await
                    .mem_type_of(desc.local_addr, desc.len)
                    .ok_or_else(|| EngineError::ParamInvalid("local address not in any segment".into()))?;
                let remote_type = self
                    .remote_segments
                    .lock()
                    .await
                    .mem_type_of(desc.remote_addr, desc.len)
                    .ok_or_else(|| EngineError::ParamInvalid("remote address not in any segment".into()))?;
                crate::transport::parse_comm_type(placement_of(local_type), placement_of(remote_type))
            };
            if !buckets.contains_key(&comm_type) {
                order.push(comm_type);
            }
            buckets.entry(comm_type).or_default().push(desc);
        }

        Ok(order
            .into_iter()
            .map(|comm_type| (comm_type, buckets.remove(&comm_type).unwrap()))
            .collect())
    }

    /// Issues every op in one bucket on its transport, fences, then arms a
    /// completion resource. The device path is chosen when any descriptor
    /// in the bucket touches device memory, the legacy host-flag path
    /// otherwise (§4.6 "Host path"/"Device path").
    async fn dispatch_bucket(
        &self,
        transport: Arc<dyn Transport>,
        op: TransferOp,
        bucket: Vec<TransferOpDesc>,
    ) -> Result<RequestHandle> {
        let mut use_device_path = false;
        {
            let local_segments = self.local_segments.lock().await;
            let remote_segments = self.remote_segments.lock().await;
            for d in &bucket {
                if local_segments.mem_type_of(d.local_addr, d.len) == Some(MemType::Device)
                    || remote_segments.mem_type_of(d.remote_addr, d.len) == Some(MemType::Device)
                {
                    use_device_path = true;
                    break;
                }
            }
        }

        let handle = if use_device_path {
            let (slot_index, flag) = self.completion_pool.acquire().await?;
            RequestHandle::Device { slot_index, flag }
        } else {
            let (queue_index, flag) = self.legacy_queue.acquire().await?;
            RequestHandle::Legacy { queue_index, flag }
        };

        let completion_flag = match &handle {
            RequestHandle::Device { flag, .. } | RequestHandle::Legacy { flag, .. } => flag.clone(),
        };
        let pool_index = match &handle {
            RequestHandle::Device { slot_index, .. } => Some(*slot_index),
            RequestHandle::Legacy { .. } => None,
        };
        if let Some(index) = pool_index {
            self.completion_pool.mark_posted(index).await;
        }

        tokio::spawn(run_bucket(transport, op, bucket, completion_flag));
        Ok(handle)
    }

    /// `get_transfer_status`: AND-reduces every bucket's completion state.
    /// Any bucket that is not yet complete makes the whole request
    /// `Waiting`; once every bucket reports complete, every slot/queue
    /// entry is released and the request is forgotten (§7 "once a request
    /// is reported anything other than Waiting, its handle is consumed").
    pub async fn get_transfer_status(&self, id: u64) -> Result<TransferStatus> {
        if self.finalizing.load(Ordering::Acquire) {
            return Ok(TransferStatus::Failed);
        }
        let mut pending = self.pending.lock().await;
        let Some(request) = pending.get(&id) else {
            return Err(EngineError::ParamInvalid(format!("unknown or already-consumed request {id}")));
        };

        let mut all_complete = true;
        for handle in &request.handles {
            if !handle.is_complete() {
                all_complete = false;
            }
        }
        if !all_complete {
            return Ok(TransferStatus::Waiting);
        }

        let request = pending.remove(&id).expect("checked above");
        for handle in request.handles {
            match handle {
                RequestHandle::Device { slot_index, .. } => self.completion_pool.release(slot_index).await,
                RequestHandle::Legacy { queue_index, .. } => self.legacy_queue.release(queue_index).await,
            }
        }
        Ok(TransferStatus::Completed)
    }

    /// `transfer_sync`: launches the batch, then polls at 1 ms intervals
    /// until Completed or the deadline elapses (§4.6.1).
    pub async fn transfer_sync(&self, op: TransferOp, descs: &[TransferOpDesc], timeout_ms: u32) -> Result<()> {
        let id = self.batch_transfer(op, descs).await?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            match self.get_transfer_status(id).await? {
                TransferStatus::Completed => return Ok(()),
                TransferStatus::Failed => return Err(EngineError::Failed("transfer failed".into())),
                TransferStatus::Timeout => return Err(EngineError::Timeout("transfer".into())),
                TransferStatus::Waiting => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::Timeout("transfer_sync deadline elapsed".into()));
                    }
                    sleep(READINESS_POLL_INTERVAL).await;
                }
            }
        }
    }
}

async fn run_bucket(
    transport: Arc<dyn Transport>,
    op: TransferOp,
    bucket: Vec<TransferOpDesc>,
    flag: crate::completion::CompletionFlag,
) {
    for desc in &bucket {
        let result = match op {
            TransferOp::Read => transport.read(desc.local_addr, desc.remote_addr, desc.len).await,
            TransferOp::Write => transport.write(desc.local_addr, desc.remote_addr, desc.len).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "one-sided op failed, leaving completion flag unset");
            return;
        }
    }
    if let Err(e) = transport.fence().await {
        warn!(error = %e, "channel fence failed, leaving completion flag unset");
        return;
    }
    flag.store(1, std::sync::atomic::Ordering::Release);
}

async fn connect_with_retry(remote_addr: &str, deadline: Instant) -> Result<TcpStream> {
    loop {
        let addrs: Vec<SocketAddr> = lookup_host(remote_addr)
            .await
            .map_err(|e| EngineError::ParamInvalid(format!("cannot resolve '{remote_addr}': {e}")))?
            .collect();
        for addr in &addrs {
            if let Ok(stream) = TcpStream::connect(addr).await {
                configure_socket(&stream)?;
                return Ok(stream);
            }
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout(format!("connect to {remote_addr}")));
        }
        sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

/// §4.1 "Socket configuration": `TCP_NODELAY`, matching the teacher's
/// `start_client` use of `socket2` for the same option (tokio exposes it
/// directly on `TcpStream`, so no raw-fd juggling is needed here).
/// `SO_REUSEADDR` and `IPv6_V6ONLY` are bind-side concerns handled by the
/// server; `SIGPIPE` is a process-global setting irrelevant on a Tokio
/// runtime, which never lets a broken pipe raise a signal.
fn configure_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).map_err(EngineError::from)
}

async fn find_local_endpoint(
    endpoints: &Arc<Mutex<HashMap<u64, Arc<Endpoint>>>>,
    descriptor: &EndpointDescriptor,
) -> Option<Arc<Endpoint>> {
    endpoints
        .lock()
        .await
        .values()
        .find(|ep| ep.descriptor == *descriptor)
        .cloned()
}

async fn wait_for_readiness(
    endpoints: &Arc<Mutex<HashMap<u64, Arc<Endpoint>>>>,
    channels: &[(u64, u64)],
    deadline: Instant,
) -> Result<()> {
    loop {
        let mut all_ready = true;
        {
            let map = endpoints.lock().await;
            for &(endpoint_handle, channel_handle) in channels {
                let Some(endpoint) = map.get(&endpoint_handle) else {
                    continue;
                };
                match endpoint.channel_status(channel_handle).await {
                    Ok(0) => {}
                    _ => all_ready = false,
                }
            }
        }
        if all_ready {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout("waiting for channel readiness".into()));
        }
        sleep(READINESS_POLL_INTERVAL).await;
    }
}

/// Step 5: fetch and import the peer's exported regions, recording each
/// into our own `server_regions` (§4.5 step 5 — regions belonging to the
/// peer, exposed to us, recorded in the map named from the peer's point of
/// view) and into a fresh remote segment table.
async fn import_peer_regions(
    stream: &mut TcpStream,
    registry: &Arc<MemoryRegistry>,
    deadline: Instant,
) -> Result<(SegmentTable, Vec<MemHandle>)> {
    let remaining = deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1));
    codec::write_message(
        stream,
        MsgType::GetRemoteMemReq,
        &codec::encode_struct(&GetRemoteMemReq { dst_endpoint_handle: 0 })?,
        remaining,
    )
    .await?;
    let (msg_type, body) = codec::read_message(stream, remaining).await?;
    if msg_type != MsgType::GetRemoteMemResp {
        return Err(EngineError::Failed(format!("unexpected reply {msg_type:?} to remote-mem fetch")));
    }
    let resp: GetRemoteMemResp = codec::decode_json(&body)?;

    let mut remote_segments = SegmentTable::new();
    let mut imported = Vec::with_capacity(resp.mem_descs.len());
    for desc in resp.mem_descs {
        let mem_type = if desc.mem_type == 1 { MemType::Device } else { MemType::Host };
        match registry.register(Role::Server, desc.addr, desc.size, mem_type) {
            Ok(handle) => {
                imported.push(handle);
                remote_segments.add(mem_type, desc.addr, desc.addr + desc.size);
            }
            Err(e) => {
                debug!(error = %e, addr = desc.addr, "rolling back partially-imported peer regions");
                for handle in imported {
                    let _ = registry.deregister(Role::Server, handle);
                }
                return Err(e);
            }
        }
    }
    Ok((remote_segments, imported))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(protocol: Protocol, placement: Placement, comm_id: &str, plane: Option<u32>, dst_eid: Option<&str>) -> EndpointDescriptor {
        EndpointDescriptor {
            protocol,
            placement,
            comm_id: comm_id.to_string(),
            plane,
            dst_eid: dst_eid.map(String::from),
            net_instance_id: Some(1),
        }
    }

    #[test]
    fn roce_is_forced_on_superpod_mismatch() {
        let mut local = vec![desc(Protocol::Roce, Placement::Host, "l", None, None)];
        let mut remote = vec![desc(Protocol::Roce, Placement::Host, "r", None, None)];
        local[0].net_instance_id = Some(1);
        remote[0].net_instance_id = Some(2);
        assert!(must_use_roce(&local, &remote));
    }

    #[test]
    fn ub_pairing_matches_on_plane_and_eid() {
        let local = vec![desc(Protocol::UbCtp, Placement::Device, "eid-a", Some(1), None)];
        let remote = vec![desc(Protocol::UbCtp, Placement::Device, "r", Some(1), Some("eid-a"))];
        let pairings = try_match_ub(&local, &remote);
        assert_eq!(pairings.len(), 1);
        assert_eq!(pairings[0].comm_type, CommType::UbDeviceToDevice);
    }

    #[test]
    fn ub_pairing_is_a_partial_match_success() {
        let local = vec![
            desc(Protocol::UbCtp, Placement::Device, "l1", Some(1), None),
            desc(Protocol::UbCtp, Placement::Host, "l2", Some(9), None),
        ];
        let remote = vec![desc(Protocol::UbCtp, Placement::Device, "r1", Some(1), None)];
        let pairings = try_match_ub(&local, &remote);
        assert_eq!(pairings.len(), 1);
    }

    #[test]
    fn empty_dst_eid_matches_any() {
        let l = desc(Protocol::UbCtp, Placement::Host, "l", Some(2), None);
        let r = desc(Protocol::UbCtp, Placement::Host, "r", Some(2), None);
        assert!(ub_key_matches(&l, Placement::Host, &&r));
    }
}
