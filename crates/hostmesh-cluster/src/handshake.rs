//! Join handshake messages
//!
//! During the handshake every message is a length-prefixed UTF-8 JSON object
//! (`[length:4][json]`). Once a connection is handed to the membership
//! manager it switches to binary frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use hostmesh_core::types::{HostId, HostInfo, VersionInfo};
use hostmesh_core::MAX_HANDSHAKE_SIZE;
use hostmesh_crypto::{sign_fields, verify_fields, CryptoError};

use crate::coordinator::InstanceId;
use crate::error::{ClusterError, ClusterResult};

/// Byte a joining host sends to the leader once it is connected to everyone
pub const JOIN_COMPLETE: u8 = 0x01;

/// First message on every accepted connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinRequest {
    /// A new host asks the leader for a host id
    #[serde(rename = "REQUEST_HOSTID")]
    RequestHostId(HostIdRequest),
    /// A host with an assigned id announces itself to an existing member
    #[serde(rename = "PUBLISH_HOSTID")]
    PublishHostId(PublishHostId),
    /// An additional sub-connection for an already identified host
    RequestConnection(ConnectionRequest),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostIdRequest {
    pub host_display_name: String,
    /// Advertised address, empty to let the leader report what it sees
    pub address: String,
    pub port: u16,
    pub version: VersionInfo,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl HostIdRequest {
    fn port_string(&self) -> String {
        self.port.to_string()
    }

    fn timestamp_string(&self) -> String {
        self.timestamp.to_string()
    }

    pub fn sign(&mut self, secret: &[u8]) -> Result<(), CryptoError> {
        let (port, timestamp) = (self.port_string(), self.timestamp_string());
        let signature = sign_fields(
            secret,
            &[
                &self.host_display_name,
                &self.address,
                &port,
                &self.version.version_string,
                &timestamp,
            ],
        )?;
        self.signature = Some(signature);
        Ok(())
    }

    pub fn verify(&self, secret: &[u8]) -> Result<(), CryptoError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| CryptoError::InvalidSignature("Request is not signed".into()))?;
        let (port, timestamp) = (self.port_string(), self.timestamp_string());
        verify_fields(
            secret,
            &[
                &self.host_display_name,
                &self.address,
                &port,
                &self.version.version_string,
                &timestamp,
            ],
            signature,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostIdResponse {
    Accepted(HostIdAccepted),
    Rejected(JoinRejection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostIdAccepted {
    pub new_host_id: HostId,
    /// Joiner address as seen by the leader
    pub reported_address: String,
    /// Every admitted host, leader first
    pub hosts: Vec<HostInfo>,
    pub timestamp: i64,
    pub version: VersionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRejection {
    pub reason: String,
    pub may_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishHostId {
    pub host_id: HostId,
    pub address: String,
    pub port: u16,
    pub host_display_name: String,
    pub version: VersionInfo,
}

impl PublishHostId {
    pub fn host_info(&self) -> HostInfo {
        HostInfo::new(
            self.host_id,
            self.address.clone(),
            self.port,
            self.host_display_name.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub host_id: HostId,
}

/// Answer to [`PublishHostId`] and [`ConnectionRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerAck {
    Accepted(PeerAccepted),
    Rejected(PeerRejected),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAccepted {
    pub timestamp: i64,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRejected {
    pub reason: String,
}

pub async fn write_json<W, T>(writer: &mut W, value: &T) -> ClusterResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_HANDSHAKE_SIZE {
        return Err(ClusterError::Handshake(format!(
            "Handshake message of {} bytes exceeds maximum {}",
            body.len(),
            MAX_HANDSHAKE_SIZE
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one handshake message, never consuming bytes beyond it
pub async fn read_json<R, T>(reader: &mut R) -> ClusterResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_HANDSHAKE_SIZE {
        return Err(ClusterError::Handshake(format!(
            "Handshake message of {} bytes exceeds maximum {}",
            len, MAX_HANDSHAKE_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Offset of a remote clock against the local one, sampled around a round
/// trip: positive when the remote clock is ahead
pub fn clock_skew(sent_at: i64, remote_timestamp: i64, received_at: i64) -> i64 {
    remote_timestamp - (sent_at + received_at) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HostIdRequest {
        HostIdRequest {
            host_display_name: "node-b".into(),
            address: "10.0.0.2".into(),
            port: 3021,
            version: VersionInfo::new("1.0", None),
            timestamp: 1_700_000_000_000,
            signature: None,
        }
    }

    #[test]
    fn test_request_type_tag() {
        let json = serde_json::to_value(JoinRequest::RequestHostId(request())).unwrap();
        assert_eq!(json["type"], "REQUEST_HOSTID");
        assert_eq!(json["hostDisplayName"], "node-b");
        assert_eq!(json["version"]["versionString"], "1.0");

        let json = serde_json::to_value(JoinRequest::RequestConnection(ConnectionRequest {
            host_id: 4,
        }))
        .unwrap();
        assert_eq!(json["type"], "REQUEST_CONNECTION");
        assert_eq!(json["hostId"], 4);
    }

    #[test]
    fn test_unknown_request_type() {
        let parsed: JoinRequest =
            serde_json::from_str(r#"{"type":"REQUEST_COFFEE","hostId":1}"#).unwrap();
        assert_eq!(parsed, JoinRequest::Unknown);
    }

    #[test]
    fn test_signature() {
        let mut req = request();
        req.sign(b"secret").unwrap();
        assert!(req.verify(b"secret").is_ok());
        assert!(req.verify(b"wrong").is_err());

        req.port = 3022;
        assert!(req.verify(b"secret").is_err());

        assert!(request().verify(b"secret").is_err());
    }

    #[test]
    fn test_rejection_shape() {
        let json = serde_json::to_value(HostIdResponse::Rejected(JoinRejection {
            reason: "paused".into(),
            may_retry: true,
        }))
        .unwrap();
        assert_eq!(json["status"], "REJECTED");
        assert_eq!(json["mayRetry"], true);
    }

    #[test]
    fn test_clock_skew() {
        assert_eq!(clock_skew(1000, 1060, 1020), 50);
        assert_eq!(clock_skew(1000, 980, 1020), -30);
    }

    #[tokio::test]
    async fn test_json_framing_reads_one_message() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_json(&mut a, &ConnectionRequest { host_id: 1 }).await.unwrap();
        a.write_all(&[0xAA, 0xBB]).await.unwrap();

        let req: ConnectionRequest = read_json(&mut b).await.unwrap();
        assert_eq!(req.host_id, 1);

        // Bytes after the message stay in the stream
        let mut rest = [0u8; 2];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let result: ClusterResult<ConnectionRequest> = read_json(&mut b).await;
        assert!(matches!(result, Err(ClusterError::Handshake(_))));
    }
}
