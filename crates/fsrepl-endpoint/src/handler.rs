//! Server-side dispatcher replaying wire calls against a local endpoint.

use async_trait::async_trait;
use fsrepl_transport::{DataStream, RemoteError, Reply, RpcHandler};
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, LocalEndpoint};
use crate::error::{EndpointError, Result};
use crate::pdu::{
    self, Call, DestroySnapshotsReq, ListFilesystemReq, ListFilesystemRes,
    ListFilesystemVersionsReq, ListFilesystemVersionsRes, ReceiveReq, ReceiveRes, SendReq,
    SnapshotReplicationStatusReq, StreamDirection,
};

/// [`RpcHandler`] serving one [`LocalEndpoint`].
pub struct Dispatcher {
    endpoint: LocalEndpoint,
}

impl Dispatcher {
    /// Serve `endpoint`.
    pub fn new(endpoint: LocalEndpoint) -> Self {
        Self { endpoint }
    }

    async fn dispatch(
        &self,
        name: &str,
        structured: Vec<u8>,
        stream: Option<DataStream>,
    ) -> Result<Reply> {
        let call = Call::from_name(name).ok_or(EndpointError::NoHandler)?;
        // Capability before stream shape: a mismatch answers only "no handler".
        if !self.endpoint.serves(call.capability()) {
            return Err(EndpointError::NoHandler);
        }
        let stream = match (call.stream() == StreamDirection::Request, stream) {
            (true, None) => {
                return Err(EndpointError::Protocol(
                    "request does not contain a stream".to_string(),
                ))
            }
            (false, Some(_unexpected)) => {
                return Err(EndpointError::Protocol(
                    "request contains unexpected stream".to_string(),
                ))
            }
            (_, stream) => stream,
        };

        match call {
            Call::ListFilesystems => {
                let _: ListFilesystemReq = pdu::decode(&structured)?;
                let filesystems = self.endpoint.list_filesystems().await?;
                Ok(Reply::structured(pdu::encode(&ListFilesystemRes {
                    filesystems,
                })?))
            }
            Call::ListFilesystemVersions => {
                let req: ListFilesystemVersionsReq = pdu::decode(&structured)?;
                let versions = self
                    .endpoint
                    .list_filesystem_versions(&req.filesystem)
                    .await?;
                Ok(Reply::structured(pdu::encode(&ListFilesystemVersionsRes {
                    versions,
                })?))
            }
            Call::DestroySnapshots => {
                let req: DestroySnapshotsReq = pdu::decode(&structured)?;
                let res = self.endpoint.destroy_snapshots(req).await?;
                Ok(Reply::structured(pdu::encode(&res)?))
            }
            Call::Send => {
                let sender = self.endpoint.sender().ok_or(EndpointError::NoHandler)?;
                let req: SendReq = pdu::decode(&structured)?;
                let (res, stream) = sender.send(req).await?;
                Ok(Reply::with_stream(pdu::encode(&res)?, stream))
            }
            Call::SnapshotReplicationStatus => {
                let sender = self.endpoint.sender().ok_or(EndpointError::NoHandler)?;
                let req: SnapshotReplicationStatusReq = pdu::decode(&structured)?;
                let res = sender.snapshot_replication_status(req).await?;
                Ok(Reply::structured(pdu::encode(&res)?))
            }
            Call::Receive => {
                let receiver = self.endpoint.receiver().ok_or(EndpointError::NoHandler)?;
                let req: ReceiveReq = pdu::decode(&structured)?;
                let stream = stream.ok_or_else(|| {
                    EndpointError::Protocol("request does not contain a stream".to_string())
                })?;
                receiver.receive(req, stream).await?;
                Ok(Reply::structured(pdu::encode(&ReceiveRes {})?))
            }
        }
    }
}

#[async_trait]
impl RpcHandler for Dispatcher {
    async fn handle(
        &self,
        endpoint: &str,
        structured: Vec<u8>,
        stream: Option<DataStream>,
    ) -> std::result::Result<Reply, RemoteError> {
        match self.dispatch(endpoint, structured, stream).await {
            Ok(reply) => {
                debug!(endpoint, role = self.endpoint.role(), "call served");
                Ok(reply)
            }
            Err(e) => {
                warn!(endpoint, role = self.endpoint.role(), kind = ?e.kind(), error = %e, "call failed");
                Err(RemoteError::new(e.kind().code(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MemBackend;
    use crate::dataset::DatasetPath;
    use crate::error::ErrorKind;
    use crate::filter::AnyVersion;
    use crate::mapfilter::DatasetMapFilter;
    use crate::receiver::LocalReceiver;
    use crate::sender::LocalSender;
    use fsrepl_transport::stream::{from_bytes, read_to_end};

    fn p(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    fn sender_dispatcher() -> Dispatcher {
        let be = Arc::new(MemBackend::new());
        be.add_filesystem(&p("pool"));
        be.add_snapshot(&p("pool"), "s1", b"data".to_vec()).unwrap();
        let filter = DatasetMapFilter::new_filter([("pool<", "ok")]).unwrap();
        let sender = LocalSender::new(be, Arc::new(filter), Arc::new(AnyVersion));
        Dispatcher::new(LocalEndpoint::Sender(Arc::new(sender)))
    }

    fn receiver_dispatcher() -> Dispatcher {
        let be = Arc::new(MemBackend::new());
        be.add_filesystem(&p("backup"));
        let map = DatasetMapFilter::new_mapping([("<", "backup")]).unwrap();
        let receiver = LocalReceiver::new(be, Arc::new(map), Arc::new(AnyVersion)).unwrap();
        Dispatcher::new(LocalEndpoint::Receiver(Arc::new(receiver)))
    }

    #[tokio::test]
    async fn test_unknown_call_has_no_handler() {
        let d = sender_dispatcher();
        let err = d.handle("ReplicationCursor", Vec::new(), None).await.err().unwrap();
        assert_eq!(err.message, "no handler for given endpoint");
        assert_eq!(err.code, ErrorKind::Protocol.code());
    }

    #[tokio::test]
    async fn test_capability_mismatch_has_no_handler() {
        let d = receiver_dispatcher();
        let req = pdu::encode(&SendReq {
            filesystem: "pool".into(),
            from: None,
            to: "@s1".into(),
        })
        .unwrap();
        let err = d.handle(Call::Send.name(), req, None).await.err().unwrap();
        assert_eq!(err.message, "no handler for given endpoint");

        let d = sender_dispatcher();
        let req = pdu::encode(&ReceiveReq {
            filesystem: "pool".into(),
        })
        .unwrap();
        let err = d
            .handle(Call::Receive.name(), req.clone(), Some(from_bytes(b"x".to_vec())))
            .await
            .err()
            .unwrap();
        assert_eq!(err.message, "no handler for given endpoint");

        // A wrong stream shape on top of the mismatch still answers "no handler".
        let err = d.handle(Call::Receive.name(), req, None).await.err().unwrap();
        assert_eq!(err.message, "no handler for given endpoint");
        assert_eq!(err.code, ErrorKind::Protocol.code());

        let d = receiver_dispatcher();
        let req = pdu::encode(&SnapshotReplicationStatusReq {
            filesystem: "pool".into(),
            snapshot: "s1".into(),
            op: 0,
        })
        .unwrap();
        let err = d
            .handle(Call::SnapshotReplicationStatus.name(), req, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.message, "no handler for given endpoint");

        let req = pdu::encode(&SendReq {
            filesystem: "pool".into(),
            from: None,
            to: "@s1".into(),
        })
        .unwrap();
        let err = d
            .handle(Call::Send.name(), req, Some(from_bytes(b"x".to_vec())))
            .await
            .err()
            .unwrap();
        assert_eq!(err.message, "no handler for given endpoint");
    }

    #[tokio::test]
    async fn test_send_replies_with_stream() {
        let d = sender_dispatcher();
        let req = pdu::encode(&SendReq {
            filesystem: "pool".into(),
            from: None,
            to: "@s1".into(),
        })
        .unwrap();
        let reply = d.handle(Call::Send.name(), req, None).await.ok().unwrap();
        let res: pdu::SendRes = pdu::decode(&reply.structured).unwrap();
        assert_eq!(res.expected_size, 4);
        assert_eq!(read_to_end(reply.stream.unwrap()).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_stream_shape_enforced() {
        let d = sender_dispatcher();
        let req = pdu::encode(&ListFilesystemReq {}).unwrap();
        let err = d
            .handle(
                Call::ListFilesystems.name(),
                req,
                Some(from_bytes(b"x".to_vec())),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorKind::Protocol.code());

        let d = receiver_dispatcher();
        let req = pdu::encode(&ReceiveReq {
            filesystem: "pool".into(),
        })
        .unwrap();
        let err = d.handle(Call::Receive.name(), req, None).await.err().unwrap();
        assert_eq!(err.code, ErrorKind::Protocol.code());
    }

    #[tokio::test]
    async fn test_undecodable_request_is_protocol_error() {
        let d = sender_dispatcher();
        let err = d
            .handle(Call::ListFilesystemVersions.name(), vec![1, 2, 3], None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorKind::Protocol.code());
    }

    #[tokio::test]
    async fn test_filtered_error_keeps_classification() {
        let d = sender_dispatcher();
        let req = pdu::encode(&ListFilesystemVersionsReq {
            filesystem: "tank".into(),
        })
        .unwrap();
        let err = d
            .handle(Call::ListFilesystemVersions.name(), req, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorKind::Filtered.code());
        assert_eq!(err.message, "endpoint does not allow access to filesystem tank");
    }

    #[tokio::test]
    async fn test_receive_dispatched() {
        let d = receiver_dispatcher();
        let req = pdu::encode(&ReceiveReq {
            filesystem: "pool".into(),
        })
        .unwrap();
        let reply = d
            .handle(Call::Receive.name(), req, Some(from_bytes(b"abc".to_vec())))
            .await
            .ok()
            .unwrap();
        assert!(reply.stream.is_none());
    }
}
