//! gRPC transport.
//!
//! One lazily connected tonic channel is kept per peer address. Channels are
//! created on first use and reused; a failed call drops the cached channel so
//! the next request reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tonic::transport::{Channel, Endpoint};

use super::Transport;
use crate::config::SyncConfig;
use crate::directory::NodeDirectory;
use crate::error::TransportFailure;
use crate::protocol::{
    LoadResponse, NodeId, NodeRequest, NodeResponse, SyncResponse, UnloadResponse,
};
use crate::rpc::proto::{self, node_service_client::NodeServiceClient};

pub struct GrpcTransport {
    directory: Arc<dyn NodeDirectory>,
    connect_timeout: Duration,
    request_timeout: Duration,
    channels: DashMap<NodeId, Channel>,
}

impl GrpcTransport {
    pub fn new(directory: Arc<dyn NodeDirectory>, config: &SyncConfig) -> Self {
        Self {
            directory,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.fan_out_timeout_ms),
            channels: DashMap::new(),
        }
    }

    fn channel(&self, node_id: &str) -> Result<Channel, TransportFailure> {
        if let Some(channel) = self.channels.get(node_id) {
            return Ok(channel.value().clone());
        }

        let address = self
            .directory
            .address_of(node_id)
            .ok_or_else(|| TransportFailure::new(node_id, "address unknown"))?;
        let uri = if address.contains("://") {
            address
        } else {
            format!("http://{}", address)
        };

        let channel = Endpoint::from_shared(uri)
            .map_err(|e| TransportFailure::new(node_id, format!("invalid endpoint address: {}", e)))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .connect_lazy();

        self.channels.insert(node_id.to_string(), channel.clone());
        Ok(channel)
    }

    async fn call(
        &self,
        node_id: &str,
        request: NodeRequest,
    ) -> Result<NodeResponse, TransportFailure> {
        let mut client = NodeServiceClient::new(self.channel(node_id)?);
        let failed = |e: tonic::Status| TransportFailure::new(node_id, e.message().to_string());
        let malformed = |e: crate::error::SyncError| TransportFailure::new(node_id, e.to_string());

        let response = match request {
            NodeRequest::Sync(r) => {
                let reply = client
                    .sync(proto::SyncRequest::from(r))
                    .await
                    .map_err(failed)?;
                NodeResponse::Sync(SyncResponse::try_from(reply.into_inner()).map_err(malformed)?)
            }
            NodeRequest::Broadcast(r) => {
                let reply = client
                    .broadcast(proto::BroadcastRequest::from(r))
                    .await
                    .map_err(failed)?;
                NodeResponse::Broadcast(reply.into_inner().into())
            }
            NodeRequest::Load(r) => {
                let reply = client
                    .load(proto::LoadRequest::from(r))
                    .await
                    .map_err(failed)?;
                NodeResponse::Load(LoadResponse::try_from(reply.into_inner()).map_err(malformed)?)
            }
            NodeRequest::Unload(r) => {
                let reply = client
                    .unload(proto::UnloadRequest::from(r))
                    .await
                    .map_err(failed)?;
                NodeResponse::Unload(
                    UnloadResponse::try_from(reply.into_inner()).map_err(malformed)?,
                )
            }
        };
        Ok(response)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(
        &self,
        node_id: &str,
        request: NodeRequest,
    ) -> Result<NodeResponse, TransportFailure> {
        let kind = request.kind();
        let result = self.call(node_id, request).await;
        if let Err(failure) = &result {
            tracing::debug!(node_id, kind, reason = %failure.reason, "gRPC call failed");
            self.channels.remove(node_id);
        }
        result
    }
}
