//! Client-side stub forwarding endpoint calls over the wire.

use std::sync::Arc;

use async_trait::async_trait;
use fsrepl_transport::{DataStream, RpcClient};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::dataset::FilesystemVersion;
use crate::endpoint::{Endpoint, Receiver, Sender};
use crate::error::{EndpointError, Result};
use crate::pdu::{
    self, Call, DestroySnapshotsReq, DestroySnapshotsRes, Filesystem, ListFilesystemReq,
    ListFilesystemRes, ListFilesystemVersionsReq, ListFilesystemVersionsRes, ReceiveReq,
    ReceiveRes, SendReq, SendRes, SnapshotReplicationStatusReq, SnapshotReplicationStatusRes,
    StreamDirection,
};

/// Endpoint living on the other end of an [`RpcClient`].
///
/// Implements both roles; calls the peer cannot serve fail with the peer's
/// "no handler" error.
#[derive(Clone)]
pub struct RemoteEndpoint {
    client: Arc<RpcClient>,
}

impl RemoteEndpoint {
    /// Wrap a connected client.
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    /// Issue `call` and check that the reply's stream matches the call's
    /// shape.
    async fn call<Req, Res>(
        &self,
        call: Call,
        req: &Req,
        stream: Option<DataStream>,
    ) -> Result<(Res, Option<DataStream>)>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned + Send,
    {
        let structured = pdu::encode(req)?;
        debug!(call = call.name(), peer = self.client.peer_addr(), "remote call");
        let (reply, reply_stream) = self
            .client
            .request_reply(call.name(), structured, stream)
            .await?;
        let expect_stream = call.stream() == StreamDirection::Response;
        match (expect_stream, reply_stream) {
            (true, None) => Err(EndpointError::Protocol(
                "response does not contain a stream".to_string(),
            )),
            (false, Some(_unexpected)) => Err(EndpointError::Protocol(
                "response contains unexpected stream".to_string(),
            )),
            (_, reply_stream) => Ok((pdu::decode(&reply)?, reply_stream)),
        }
    }
}

#[async_trait]
impl Endpoint for RemoteEndpoint {
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        let (res, _): (ListFilesystemRes, _) = self
            .call(Call::ListFilesystems, &ListFilesystemReq {}, None)
            .await?;
        Ok(res.filesystems)
    }

    async fn list_filesystem_versions(&self, fs: &str) -> Result<Vec<FilesystemVersion>> {
        let req = ListFilesystemVersionsReq {
            filesystem: fs.to_string(),
        };
        let (res, _): (ListFilesystemVersionsRes, _) = self
            .call(Call::ListFilesystemVersions, &req, None)
            .await?;
        Ok(res.versions)
    }

    async fn destroy_snapshots(&self, req: DestroySnapshotsReq) -> Result<DestroySnapshotsRes> {
        let (res, _) = self.call(Call::DestroySnapshots, &req, None).await?;
        Ok(res)
    }
}

#[async_trait]
impl Sender for RemoteEndpoint {
    async fn send(&self, req: SendReq) -> Result<(SendRes, DataStream)> {
        let (res, stream) = self.call(Call::Send, &req, None).await?;
        let stream = stream.ok_or_else(|| {
            EndpointError::Protocol("response does not contain a stream".to_string())
        })?;
        Ok((res, stream))
    }

    async fn snapshot_replication_status(
        &self,
        req: SnapshotReplicationStatusReq,
    ) -> Result<SnapshotReplicationStatusRes> {
        let (res, _) = self
            .call(Call::SnapshotReplicationStatus, &req, None)
            .await?;
        Ok(res)
    }
}

#[async_trait]
impl Receiver for RemoteEndpoint {
    async fn receive(&self, req: ReceiveReq, stream: DataStream) -> Result<()> {
        let (_res, _): (ReceiveRes, _) = self.call(Call::Receive, &req, Some(stream)).await?;
        Ok(())
    }
}
