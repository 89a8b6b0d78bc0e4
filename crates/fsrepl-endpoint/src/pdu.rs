//! Wire messages and the call catalogue.
//!
//! Every structured payload is one of the messages below, serialized with
//! bincode using fixed-width integers. Decoding rejects trailing bytes and
//! anything larger than a transport frame.

use bincode::Options;
use fsrepl_transport::protocol::MAX_PAYLOAD_SIZE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dataset::FilesystemVersion;
use crate::error::{EndpointError, Result};

/// A filesystem as advertised to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    /// Path in the peer's namespace.
    pub path: String,
    /// Continuation state of an interrupted transfer. Never set by the local
    /// endpoints.
    pub resume_token: Option<String>,
}

impl Filesystem {
    /// Filesystem without continuation state.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            resume_token: None,
        }
    }
}

/// ListFilesystems request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesystemReq {}

/// ListFilesystems response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesystemRes {
    /// Visible filesystems.
    pub filesystems: Vec<Filesystem>,
}

/// ListFilesystemVersions request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesystemVersionsReq {
    /// Filesystem path.
    pub filesystem: String,
}

/// ListFilesystemVersions response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesystemVersionsRes {
    /// Versions, oldest first.
    pub versions: Vec<FilesystemVersion>,
}

/// Send request. `from` and `to` are relative version names (`@snap`,
/// `#bookmark`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReq {
    /// Filesystem path.
    pub filesystem: String,
    /// Incremental source; `None` requests a full send.
    pub from: Option<String>,
    /// Snapshot to send up to.
    pub to: String,
}

/// Send response; the stream rides alongside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRes {
    /// Advisory size of the stream in bytes.
    pub expected_size: u64,
}

/// Receive request; the stream rides alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveReq {
    /// Target filesystem in the sender's namespace.
    pub filesystem: String,
}

/// Receive response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveRes {}

/// DestroySnapshots request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySnapshotsReq {
    /// Filesystem path.
    pub filesystem: String,
    /// Versions to destroy; all must be snapshots.
    pub snapshots: Vec<FilesystemVersion>,
}

/// Outcome for one snapshot of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySnapshotRes {
    /// Snapshot as requested.
    pub snapshot: FilesystemVersion,
    /// Error text, empty on success.
    pub error: String,
}

/// DestroySnapshots response: one result per requested snapshot, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySnapshotsRes {
    /// Per-snapshot outcomes.
    pub results: Vec<DestroySnapshotRes>,
}

/// Opcode of a SnapshotReplicationStatus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplicationStatusOp {
    /// Read the replicated marker.
    Get = 0,
    /// Set the replicated marker.
    SetReplicated = 1,
}

impl TryFrom<u32> for ReplicationStatusOp {
    type Error = EndpointError;

    fn try_from(op: u32) -> Result<Self> {
        match op {
            0 => Ok(ReplicationStatusOp::Get),
            1 => Ok(ReplicationStatusOp::SetReplicated),
            other => Err(EndpointError::UnknownOpcode(other)),
        }
    }
}

/// SnapshotReplicationStatus request. `op` stays a raw number on the wire
/// so an unknown opcode reaches the endpoint and fails there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReplicationStatusReq {
    /// Filesystem path.
    pub filesystem: String,
    /// Snapshot name without delimiter.
    pub snapshot: String,
    /// A [`ReplicationStatusOp`] value.
    pub op: u32,
}

impl SnapshotReplicationStatusReq {
    /// Build a request for `op`.
    pub fn new(
        filesystem: impl Into<String>,
        snapshot: impl Into<String>,
        op: ReplicationStatusOp,
    ) -> Self {
        Self {
            filesystem: filesystem.into(),
            snapshot: snapshot.into(),
            op: op as u32,
        }
    }
}

/// SnapshotReplicationStatus response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReplicationStatusRes {
    /// Marker value after the operation.
    pub replicated: bool,
}

/// Endpoint capability a call needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Served by either role.
    Any,
    /// Sender role only.
    Sender,
    /// Receiver role only.
    Receiver,
}

/// Which side of a call carries the raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Neither.
    None,
    /// The request.
    Request,
    /// The response.
    Response,
}

/// Named wire calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// List visible filesystems.
    ListFilesystems,
    /// List versions of a filesystem.
    ListFilesystemVersions,
    /// Open a send stream.
    Send,
    /// Feed a stream into a filesystem.
    Receive,
    /// Destroy a batch of snapshots.
    DestroySnapshots,
    /// Get or set a snapshot's replicated marker.
    SnapshotReplicationStatus,
}

impl Call {
    /// Every call, in catalogue order.
    pub const ALL: [Call; 6] = [
        Call::ListFilesystems,
        Call::ListFilesystemVersions,
        Call::Send,
        Call::Receive,
        Call::DestroySnapshots,
        Call::SnapshotReplicationStatus,
    ];

    /// Name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Call::ListFilesystems => "ListFilesystems",
            Call::ListFilesystemVersions => "ListFilesystemVersions",
            Call::Send => "Send",
            Call::Receive => "Receive",
            Call::DestroySnapshots => "DestroySnapshots",
            Call::SnapshotReplicationStatus => "SnapshotReplicationStatus",
        }
    }

    /// Resolve a wire name.
    pub fn from_name(name: &str) -> Option<Call> {
        Call::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Capability the serving endpoint must have.
    pub fn capability(self) -> Capability {
        match self {
            Call::Send | Call::SnapshotReplicationStatus => Capability::Sender,
            Call::Receive => Capability::Receiver,
            _ => Capability::Any,
        }
    }

    /// Stream direction of the call.
    pub fn stream(self) -> StreamDirection {
        match self {
            Call::Send => StreamDirection::Response,
            Call::Receive => StreamDirection::Request,
            _ => StreamDirection::None,
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .reject_trailing_bytes()
}

/// Serialize a message.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(msg)?)
}

/// Deserialize a message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::VersionKind;

    #[test]
    fn test_call_names_resolve() {
        for call in Call::ALL {
            assert_eq!(Call::from_name(call.name()), Some(call));
        }
        assert_eq!(Call::from_name("ReplicationCursor"), None);
        assert_eq!(Call::from_name("send"), None);
    }

    #[test]
    fn test_call_table() {
        assert_eq!(Call::Send.stream(), StreamDirection::Response);
        assert_eq!(Call::Receive.stream(), StreamDirection::Request);
        assert_eq!(Call::ListFilesystems.stream(), StreamDirection::None);
        assert_eq!(Call::Send.capability(), Capability::Sender);
        assert_eq!(Call::SnapshotReplicationStatus.capability(), Capability::Sender);
        assert_eq!(Call::Receive.capability(), Capability::Receiver);
        assert_eq!(Call::DestroySnapshots.capability(), Capability::Any);
    }

    #[test]
    fn test_opcode() {
        assert_eq!(ReplicationStatusOp::try_from(0).unwrap(), ReplicationStatusOp::Get);
        assert_eq!(
            ReplicationStatusOp::try_from(1).unwrap(),
            ReplicationStatusOp::SetReplicated
        );
        assert!(matches!(
            ReplicationStatusOp::try_from(7),
            Err(EndpointError::UnknownOpcode(7))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let req = DestroySnapshotsReq {
            filesystem: "pool/a".into(),
            snapshots: vec![FilesystemVersion {
                kind: VersionKind::Snapshot,
                name: "s1".into(),
                guid: 7,
                create_txg: 9,
            }],
        };
        let mut bytes = encode(&req).unwrap();
        assert_eq!(decode::<DestroySnapshotsReq>(&bytes).unwrap(), req);
        bytes.push(0);
        assert!(decode::<DestroySnapshotsReq>(&bytes).is_err());
        assert!(decode::<DestroySnapshotsReq>(&bytes[..3]).is_err());
    }

    #[test]
    fn test_decode_rejects_huge_length_prefix() {
        // Length prefix claiming far more elements than the limit allows.
        assert!(decode::<ListFilesystemRes>(&u64::MAX.to_le_bytes()).is_err());
    }
}
