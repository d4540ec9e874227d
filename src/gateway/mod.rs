pub mod aggregator;
pub mod lifecycle;
pub mod server;
pub mod validator;

pub use aggregator::ResultAggregator;
pub use lifecycle::{CallPhase, RequestLifecycle};
pub use server::{build_router, GatewayServer, GatewayState, ServiceCallGateway};
pub use validator::{merge_query_and_body, validate};
