pub mod channel;
pub mod invoker;
pub mod websocket;

pub use channel::{CallId, ChannelEvent, ChannelPeer, ChannelResponder, ExecutionRequest, NodeChannel};
pub use invoker::{NodeInvoker, OutcomeHandle, SettledCall};
pub use websocket::{serve_node_socket, GatewayFrame, NodeFrame, RemoteNode};
