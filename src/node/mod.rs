pub mod agent;
pub mod local;
pub mod service_table;

pub use agent::NodeAgent;
pub use local::LocalNode;
pub use service_table::{NodeError, Params, ServiceTable};
