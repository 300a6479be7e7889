//! Control-wire codec (C1): frames fixed-header + typed-body messages over a
//! TCP stream.
//!
//! Grounded in `original_source/src/hixl/common/ctrl_msg.h` for the exact
//! magic number, header layout, and message-type discriminants, and in the
//! teacher's `ipc/tcp_socket.rs` for the length-prefixed async framing style
//! (`read_message`/`write_message` over a `tokio::net::TcpStream`).

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Sentinel at the start of every control message header.
pub const MAGIC: u32 = 0xA4B3_C2D1;

/// Largest control-message body this codec will accept; guards against a
/// malformed or hostile peer claiming an unbounded `body_size`.
pub const MAX_BODY_SIZE: u64 = 4 * 1024 * 1024;

/// Discriminates the body of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MsgType {
    CreateChannelReq = 1,
    CreateChannelResp = 2,
    GetRemoteMemReq = 3,
    GetRemoteMemResp = 4,
    DestroyChannelReq = 5,
    GetEndPointInfoReq = 6,
    GetEndPointInfoResp = 7,
}

impl MsgType {
    fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            1 => MsgType::CreateChannelReq,
            2 => MsgType::CreateChannelResp,
            3 => MsgType::GetRemoteMemReq,
            4 => MsgType::GetRemoteMemResp,
            5 => MsgType::DestroyChannelReq,
            6 => MsgType::GetEndPointInfoReq,
            7 => MsgType::GetEndPointInfoResp,
            other => return Err(EngineError::Codec(format!("unknown msg_type {other}"))),
        })
    }
}

/// `CreateChannelReq{src, dst}`: `src`/`dst` are endpoint handles, opaque to
/// the wire format (the addresses identifying which local/remote endpoint
/// this channel negotiation concerns).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelReq {
    /// The requesting client's local endpoint descriptor; the server
    /// matches it against its own catalog to find the endpoint that will
    /// serve this channel (`descriptors_match`, §4.4).
    pub src: EndpointDescriptorWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelResp {
    pub result: u32,
    pub dst_endpoint_handle: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRemoteMemReq {
    pub dst_endpoint_handle: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HixlMemDesc {
    pub tag: String,
    pub export_desc: Vec<u8>,
    pub mem_type: u32,
    pub addr: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRemoteMemResp {
    pub result: u32,
    pub mem_descs: Vec<HixlMemDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyChannelReq {
    pub endpoint_handle: u64,
    pub channel_handle: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptorWire {
    pub protocol: String,
    pub comm_id: String,
    pub placement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plane: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_eid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_instance_id: Option<u64>,
}

/// Reads one header+body frame off `stream`, honoring `deadline`.
///
/// A socket EOF mid-frame is surfaced as `EngineError::NotConnected` so the
/// caller can synthesize the peer-disconnect `DestroyChannelReq` the spec
/// describes.
pub async fn read_message<R>(stream: &mut R, deadline: Duration) -> Result<(MsgType, Vec<u8>)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    timeout(deadline, async {
        let magic = stream.read_u32().await.map_err(|_| EngineError::NotConnected)?;
        if magic != MAGIC {
            return Err(EngineError::ParamInvalid(format!(
                "bad control-message magic {magic:#x}"
            )));
        }
        let body_size = stream.read_u64().await.map_err(|_| EngineError::NotConnected)?;
        if body_size < 4 || body_size > MAX_BODY_SIZE {
            return Err(EngineError::ParamInvalid(format!(
                "control-message body_size {body_size} out of range"
            )));
        }
        let msg_type = MsgType::from_u32(stream.read_u32().await.map_err(|_| EngineError::NotConnected)?)?;
        let payload_len = (body_size - 4) as usize;
        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            stream
                .read_exact(&mut payload)
                .await
                .map_err(|_| EngineError::NotConnected)?;
        }
        Ok((msg_type, payload))
    })
    .await
    .map_err(|_| EngineError::Timeout("reading control message".into()))?
}

/// Writes one header+body frame to `stream`.
pub async fn write_message<W>(
    stream: &mut W,
    msg_type: MsgType,
    payload: &[u8],
    deadline: Duration,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let body_size = 4 + payload.len() as u64;
    timeout(deadline, async {
        stream.write_u32(MAGIC).await?;
        stream.write_u64(body_size).await?;
        stream.write_u32(msg_type as u32).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|_| EngineError::Timeout("writing control message".into()))?
    .map_err(EngineError::from)
}

/// Convenience wrapper serializing a fixed-shape body with `bincode`, the
/// same serializer the teacher's `ipc::Message` uses for its payloads.
pub fn encode_struct<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| EngineError::Codec(e.to_string()))
}

pub fn decode_struct<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| EngineError::Codec(e.to_string()))
}

/// Convenience wrapper for the JSON-bodied messages (endpoint catalog,
/// exported-memory list).
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| EngineError::Codec(e.to_string()))
}

pub fn decode_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_round_trip_regardless_of_chunking() {
        let (mut a, mut b) = duplex(4096);
        let req = CreateChannelReq {
            src: EndpointDescriptorWire {
                protocol: "roce".into(),
                comm_id: "a".into(),
                placement: "host".into(),
                plane: None,
                dst_eid: None,
                net_instance_id: None,
            },
        };
        let payload = encode_struct(&req).unwrap();
        write_message(&mut a, MsgType::CreateChannelReq, &payload, Duration::from_millis(500))
            .await
            .unwrap();
        let (msg_type, body) = read_message(&mut b, Duration::from_millis(500)).await.unwrap();
        assert_eq!(msg_type, MsgType::CreateChannelReq);
        let decoded: CreateChannelReq = decode_struct(&body).unwrap();
        assert_eq!(decoded.src.comm_id, "a");
    }

    #[tokio::test]
    async fn bad_magic_is_param_invalid() {
        let (mut a, mut b) = duplex(64);
        a.write_u32(0xdead_beef).await.unwrap();
        a.write_u64(4).await.unwrap();
        a.write_u32(0).await.unwrap();
        let result = read_message(&mut b, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(EngineError::ParamInvalid(_))));
    }

    #[test]
    fn endpoint_catalog_json_round_trips() {
        let catalog = vec![EndpointDescriptorWire {
            protocol: "roce".into(),
            comm_id: "id-0".into(),
            placement: "host".into(),
            plane: Some(1),
            dst_eid: None,
            net_instance_id: Some(7),
        }];
        let bytes = encode_json(&catalog).unwrap();
        let decoded: Vec<EndpointDescriptorWire> = decode_json(&bytes).unwrap();
        assert_eq!(decoded[0].comm_id, "id-0");
    }
}
