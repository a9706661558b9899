//! Leader endpoint over the tablet server RPC layer.
//!
//! The wire encoding and connection handling belong to the RPC crate, which
//! plugs in through [`TabletServerGateway`]. Gateway failures arrive as
//! `anyhow` errors; an [`ApiError`] inside one keeps its error code, anything
//! else is a transport failure.

use super::{FetchLogRequest, FetchLogResponse, LeaderEndpoint, LeaderEndpointFactory};
use crate::error::{ReplicaError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tidewater_common::{ApiError, Offset, ServerId, TableBucket};

/// RPC client for one tablet server.
#[async_trait]
pub trait TabletServerGateway: Send + Sync {
    async fn fetch_log(&self, request: FetchLogRequest) -> anyhow::Result<FetchLogResponse>;

    /// Leader end offset snapshot of a bucket led by the remote server
    async fn leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> anyhow::Result<Offset>;
}

fn map_gateway_error(leader_id: ServerId, e: anyhow::Error) -> ReplicaError {
    match e.downcast::<ApiError>() {
        Ok(api_error) => ReplicaError::from(api_error),
        Err(e) => ReplicaError::Transport(format!("server {}: {:#}", leader_id, e)),
    }
}

/// Endpoint sending requests to a remote leader.
pub struct RemoteLeaderEndpoint {
    leader_id: ServerId,
    gateway: Arc<dyn TabletServerGateway>,
}

impl RemoteLeaderEndpoint {
    pub fn new(leader_id: ServerId, gateway: Arc<dyn TabletServerGateway>) -> Self {
        Self { leader_id, gateway }
    }
}

#[async_trait]
impl LeaderEndpoint for RemoteLeaderEndpoint {
    fn leader_server_id(&self) -> ServerId {
        self.leader_id
    }

    async fn fetch_log(&self, request: FetchLogRequest) -> Result<FetchLogResponse> {
        self.gateway
            .fetch_log(request)
            .await
            .map_err(|e| map_gateway_error(self.leader_id, e))
    }

    async fn fetch_leader_end_offset_snapshot(&self, table_bucket: &TableBucket) -> Result<Offset> {
        self.gateway
            .leader_end_offset_snapshot(table_bucket)
            .await
            .map_err(|e| map_gateway_error(self.leader_id, e))
    }
}

/// Opens a gateway to a server id.
pub type GatewayConnector =
    Arc<dyn Fn(ServerId) -> anyhow::Result<Arc<dyn TabletServerGateway>> + Send + Sync>;

/// Builds [`RemoteLeaderEndpoint`]s through a connector.
pub struct RemoteEndpointFactory {
    connector: GatewayConnector,
}

impl RemoteEndpointFactory {
    pub fn new<F>(connector: F) -> Self
    where
        F: Fn(ServerId) -> anyhow::Result<Arc<dyn TabletServerGateway>> + Send + Sync + 'static,
    {
        Self {
            connector: Arc::new(connector),
        }
    }
}

impl LeaderEndpointFactory for RemoteEndpointFactory {
    fn create(&self, leader_id: ServerId) -> Result<Arc<dyn LeaderEndpoint>> {
        let gateway = (self.connector)(leader_id).map_err(|e| map_gateway_error(leader_id, e))?;
        Ok(Arc::new(RemoteLeaderEndpoint::new(leader_id, gateway)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_common::ErrorCode;

    struct DownGateway;

    #[async_trait]
    impl TabletServerGateway for DownGateway {
        async fn fetch_log(&self, _request: FetchLogRequest) -> anyhow::Result<FetchLogResponse> {
            Err(anyhow::anyhow!("connection refused"))
        }

        async fn leader_end_offset_snapshot(&self, _table_bucket: &TableBucket) -> anyhow::Result<Offset> {
            Err(ApiError::new(ErrorCode::NotLeaderOrFollower, "server 7 does not lead 1-0").into())
        }
    }

    #[tokio::test]
    async fn test_gateway_errors_are_classified() {
        let endpoint = RemoteLeaderEndpoint::new(7, Arc::new(DownGateway));

        let err = endpoint
            .fetch_log(FetchLogRequest::new(1, 1024, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Transport(ref msg) if msg.contains("connection refused")));
        assert!(err.is_retriable());

        let err = endpoint
            .fetch_leader_end_offset_snapshot(&TableBucket::new(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NotLeaderOrFollower(_)));
    }

    #[test]
    fn test_factory_reports_connect_failure() {
        let factory = RemoteEndpointFactory::new(|id| Err(anyhow::anyhow!("no route to server {}", id)));
        match factory.create(9) {
            Err(ReplicaError::Transport(msg)) => assert!(msg.contains("no route to server 9")),
            other => panic!("unexpected result: {:?}", other.map(|e| e.leader_server_id())),
        }
    }
}
