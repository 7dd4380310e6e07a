//! Client transport seam.
//!
//! The dispatcher talks to the cluster through these traits; the actual
//! encoding and socket handling live behind them. Connections are cheap
//! handles: requests take `&self` so an in-flight send never blocks the
//! dispatcher from starting another exchange on the same connection.

use crate::cluster::Member;
use crate::core::error::RaftResult;
use crate::protocol::{
    CommandRequest, CommandResponse, KeepAliveRequest, KeepAliveResponse, MetadataRequest,
    MetadataResponse, PublishMessage, QueryRequest, QueryResponse, RegisterRequest,
    RegisterResponse, UnregisterRequest, UnregisterResponse,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connects to cluster members.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Open a connection to the given member.
    async fn connect(&self, member: &Member) -> RaftResult<Arc<dyn ClientConnection>>;
}

/// A single open connection to one member.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> RaftResult<RegisterResponse>;

    async fn keep_alive(&self, request: KeepAliveRequest) -> RaftResult<KeepAliveResponse>;

    async fn command(&self, request: CommandRequest) -> RaftResult<CommandResponse>;

    async fn query(&self, request: QueryRequest) -> RaftResult<QueryResponse>;

    async fn metadata(&self, request: MetadataRequest) -> RaftResult<MetadataResponse>;

    async fn unregister(&self, request: UnregisterRequest) -> RaftResult<UnregisterResponse>;

    /// Take the server-push event stream. Yields `None` after the first
    /// call; a connection has one stream.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PublishMessage>>;

    /// Close the connection.
    async fn close(&self);
}
