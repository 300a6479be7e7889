//! Endpoint (C2): one transport-specific communication presence of a
//! process. Owns its channel map; memory bookkeeping is delegated to the
//! process-wide [`crate::memory::MemoryRegistry`] (a deliberate
//! simplification over the original's per-endpoint region maps — see
//! `DESIGN.md` — that preserves every invariant in §3/§4.3 while avoiding
//! duplicated registries for endpoints that all share one process).
//!
//! Grounded in `original_source/src/hixl/cs/endpoint.h` and
//! `endpoint_store.h`/`.cc` for the descriptor-equality rule used during
//! catalog matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::codec::EndpointDescriptorWire;
use crate::error::{EngineError, Result};

/// Transport family an endpoint presents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Roce,
    Hccs,
    UbCtp,
    UbTp,
}

impl Protocol {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Protocol::Roce => "roce",
            Protocol::Hccs => "hccs",
            Protocol::UbCtp => "ub_ctp",
            Protocol::UbTp => "ub_tp",
        }
    }

    pub fn from_wire_str(s: &str) -> Result<Self> {
        Ok(match s {
            "roce" => Protocol::Roce,
            "hccs" => Protocol::Hccs,
            "ub_ctp" => Protocol::UbCtp,
            "ub_tp" => Protocol::UbTp,
            other => return Err(EngineError::ParamInvalid(format!("unknown protocol '{other}'"))),
        })
    }

    pub fn is_ub(&self) -> bool {
        matches!(self, Protocol::UbCtp | Protocol::UbTp)
    }
}

/// Where an endpoint's addressable memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Host,
    Device,
}

impl Placement {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Placement::Host => "host",
            Placement::Device => "device",
        }
    }

    pub fn from_wire_str(s: &str) -> Result<Self> {
        Ok(match s {
            "host" => Placement::Host,
            "device" => Placement::Device,
            other => return Err(EngineError::ParamInvalid(format!("unknown placement '{other}'"))),
        })
    }
}

/// One transport presence of a process (§3 "Endpoint descriptor").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub protocol: Protocol,
    pub placement: Placement,
    pub comm_id: String,
    pub plane: Option<u32>,
    pub dst_eid: Option<String>,
    pub net_instance_id: Option<u64>,
}

impl EndpointDescriptor {
    pub fn to_wire(&self) -> EndpointDescriptorWire {
        EndpointDescriptorWire {
            protocol: self.protocol.as_wire_str().to_string(),
            comm_id: self.comm_id.clone(),
            placement: self.placement.as_wire_str().to_string(),
            plane: self.plane,
            dst_eid: self.dst_eid.clone(),
            net_instance_id: self.net_instance_id,
        }
    }

    pub fn from_wire(wire: &EndpointDescriptorWire) -> Result<Self> {
        Ok(Self {
            protocol: Protocol::from_wire_str(&wire.protocol)?,
            placement: Placement::from_wire_str(&wire.placement)?,
            comm_id: wire.comm_id.clone(),
            plane: wire.plane,
            dst_eid: wire.dst_eid.clone(),
            net_instance_id: wire.net_instance_id,
        })
    }
}

/// `operator==(EndpointDesc, EndpointDesc)` from `endpoint_store.cc`: equal
/// if the protocol matches, and for HCCS additionally the numeric comm id.
pub fn descriptors_match(local: &EndpointDescriptor, remote: &EndpointDescriptor) -> bool {
    if local.protocol != remote.protocol {
        return false;
    }
    if local.protocol == Protocol::Hccs {
        return local.comm_id == remote.comm_id;
    }
    true
}

/// State machine for a channel: `Creating -> Ready -> Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Creating,
    Ready,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub handle: u64,
    pub remote_endpoint_handle: u64,
    pub state: ChannelState,
}

impl Channel {
    /// `GetChannelStatus`: 0 means Ready, matching the original's convention
    /// (see `channel.cc`).
    pub fn status_code(&self) -> i32 {
        match self.state {
            ChannelState::Ready => 0,
            ChannelState::Creating => 1,
            ChannelState::Destroyed => -1,
        }
    }
}

/// One local endpoint: its descriptor and the channels it owns.
pub struct Endpoint {
    pub handle: u64,
    pub descriptor: EndpointDescriptor,
    channels: Mutex<HashMap<u64, Channel>>,
    next_channel_handle: std::sync::atomic::AtomicU64,
}

impl Endpoint {
    pub fn new(handle: u64, descriptor: EndpointDescriptor) -> Self {
        Self {
            handle,
            descriptor,
            channels: Mutex::new(HashMap::new()),
            next_channel_handle: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Creates a channel in `Creating` state toward `remote_endpoint_handle`
    /// and immediately marks it `Ready` — loopback channels never fail to
    /// come up once created, unlike a real transport driver whose readiness
    /// must be polled (§4.5 step 4 still polls `channel_status`, it just
    /// always observes 0 on the first poll for this transport).
    pub async fn create_channel(&self, remote_endpoint_handle: u64) -> Channel {
        let handle = self
            .next_channel_handle
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let channel = Channel {
            handle,
            remote_endpoint_handle,
            state: ChannelState::Ready,
        };
        self.channels.lock().await.insert(handle, channel.clone());
        channel
    }

    pub async fn channel_status(&self, channel_handle: u64) -> Result<i32> {
        self.channels
            .lock()
            .await
            .get(&channel_handle)
            .map(Channel::status_code)
            .ok_or_else(|| EngineError::ParamInvalid(format!("unknown channel {channel_handle}")))
    }

    pub async fn destroy_channel(&self, channel_handle: u64) -> Result<()> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get_mut(&channel_handle) {
            channel.state = ChannelState::Destroyed;
            channels.remove(&channel_handle);
            Ok(())
        } else {
            Err(EngineError::ParamInvalid(format!("unknown channel {channel_handle}")))
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roce(comm_id: &str) -> EndpointDescriptor {
        EndpointDescriptor {
            protocol: Protocol::Roce,
            placement: Placement::Host,
            comm_id: comm_id.to_string(),
            plane: None,
            dst_eid: None,
            net_instance_id: Some(1),
        }
    }

    #[test]
    fn roce_descriptors_match_on_protocol_alone() {
        assert!(descriptors_match(&roce("a"), &roce("b")));
    }

    #[test]
    fn hccs_descriptors_require_matching_comm_id() {
        let mut a = roce("x");
        a.protocol = Protocol::Hccs;
        let mut b = roce("y");
        b.protocol = Protocol::Hccs;
        assert!(!descriptors_match(&a, &b));
        b.comm_id = "x".to_string();
        assert!(descriptors_match(&a, &b));
    }

    #[tokio::test]
    async fn channel_lifecycle() {
        let endpoint = Endpoint::new(1, roce("a"));
        let channel = endpoint.create_channel(42).await;
        assert_eq!(endpoint.channel_status(channel.handle).await.unwrap(), 0);
        endpoint.destroy_channel(channel.handle).await.unwrap();
        assert!(endpoint.channel_status(channel.handle).await.is_err());
    }
}
