//! Gateway frontend: the service and its HTTP/SSE surface

mod server;
mod service;

pub use server::{Gateway, create_router};
pub use service::GatewayService;
