//! Transport layer: wire messages, framing, connections and the server

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod idle;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod server;

pub use codec::{FramingCodec, RpcMessageCodec};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dispatch::{EchoDispatcher, RequestDispatcher, RpcServiceConfig, ServiceHandler};
pub use idle::{IdleConfig, IdleEvent, IdleKind, IdleMonitor, IdleState};
pub use message::{MessageType, RpcMessage};
pub use pipeline::{PipelineFactory, PipelineLayout, SocketOptions, StageDescriptor, StageKind};
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerLifecycleState, TransportServer};
