pub mod registry;

pub use registry::{
    InMemoryRegistry, NodeBackend, NodeEvent, NodeEventReceiver, NodeEventSender, NodeInfo,
    NodeRegistry, DEFAULT_EVENT_BUFFER,
};
