//! Request dispatch stage
//!
//! [`RequestDispatcher`] is the business-logic boundary: it receives a
//! decoded request and the id of the connection it arrived on, and returns
//! the response to write back (or nothing). It always runs on the
//! service-handler pool, never on an io thread, so it may block.
//!
//! [`ServiceHandler`] is the connection-bound stage wrapping the dispatcher:
//! it answers heartbeats itself and feeds requests to the dispatcher one at
//! a time, which keeps responses in request order per connection. Every
//! handler of a server shares one set of dispatch permits sized to the
//! service-handler pool, so at most that many dispatches run at once.

use crate::infrastructure::metrics::TransportMetrics;
use crate::transport::connection::{Connection, ConnectionId};
use crate::transport::message::{MessageType, RpcMessage};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Business dispatch collaborator
pub trait RequestDispatcher: Send + Sync + 'static {
    /// Handle one request. `None` means no reply is written.
    fn dispatch(&self, connection: ConnectionId, request: RpcMessage) -> Option<RpcMessage>;
}

impl<F> RequestDispatcher for F
where
    F: Fn(ConnectionId, RpcMessage) -> Option<RpcMessage> + Send + Sync + 'static,
{
    fn dispatch(&self, connection: ConnectionId, request: RpcMessage) -> Option<RpcMessage> {
        self(connection, request)
    }
}

/// Replies to every request with its own body
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoDispatcher;

impl RequestDispatcher for EchoDispatcher {
    fn dispatch(&self, _connection: ConnectionId, request: RpcMessage) -> Option<RpcMessage> {
        Some(request.reply(request.body.clone()))
    }
}

/// Identity of a service for (un)registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RpcServiceConfig {
    pub service_name: String,
    pub group: String,
    pub version: String,
}

impl RpcServiceConfig {
    pub fn new(
        service_name: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            group: group.into(),
            version: version.into(),
        }
    }

    /// Registry key: name + group + version
    pub fn rpc_service_name(&self) -> String {
        format!("{}{}{}", self.service_name, self.group, self.version)
    }
}

/// Connection-bound handler executed on the service-handler pool
pub struct ServiceHandler {
    connection: Arc<Connection>,
    dispatcher: Arc<dyn RequestDispatcher>,
    /// Shared by all connections; one permit per concurrent dispatch
    permits: Arc<Semaphore>,
    metrics: Arc<TransportMetrics>,
}

impl ServiceHandler {
    pub fn new(
        connection: Arc<Connection>,
        dispatcher: Arc<dyn RequestDispatcher>,
        permits: Arc<Semaphore>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            connection,
            dispatcher,
            permits,
            metrics,
        }
    }

    /// Process one decoded message, returning the reply to write
    pub fn handle(&self, message: RpcMessage) -> Option<RpcMessage> {
        match message.message_type {
            MessageType::HeartbeatPing => {
                self.metrics.record_heartbeat();
                Some(RpcMessage::pong(message.request_id))
            }
            MessageType::Request => {
                self.metrics.record_dispatch();
                self.dispatcher.dispatch(self.connection.id(), message)
            }
            other => {
                crate::log_dispatch!(
                    tracing::Level::DEBUG,
                    connection = %self.connection.id(),
                    message_type = ?other,
                    "Dropping unexpected inbound message"
                );
                None
            }
        }
    }

    /// Drain `inbound` in order until the io side hangs up.
    ///
    /// Must run on a multi-threaded runtime: the dispatcher is called through
    /// `block_in_place` so a slow dispatch does not stall sibling tasks.
    pub async fn run(self, mut inbound: mpsc::Receiver<RpcMessage>) {
        while let Some(message) = inbound.recv().await {
            let request_id = message.request_id;
            let Ok(permit) = self.permits.acquire().await else {
                // Permits are never closed while the server runs
                break;
            };
            let outcome = tokio::task::block_in_place(|| {
                panic::catch_unwind(AssertUnwindSafe(|| self.handle(message)))
            });
            drop(permit);

            let reply = match outcome {
                Ok(reply) => reply,
                Err(_) => {
                    crate::log_dispatch!(
                        tracing::Level::ERROR,
                        connection = %self.connection.id(),
                        request_id,
                        "Dispatcher panicked, closing connection"
                    );
                    self.connection.close();
                    break;
                }
            };

            if let Some(reply) = reply {
                if self.connection.write(reply).await.is_err() {
                    // Connection closed underneath us; remaining input is moot
                    break;
                }
            }
        }
    }
}
