//! Media-routing boundary and the gateway that drives it.

pub mod boundary;
mod gateway;
pub mod loopback;
pub mod ws;

pub use boundary::{
    EgressRequest, EgressSession, IngressEndpoint, ProducerRegistration, RegisteredProducer,
    RoutingBoundary,
};
pub use gateway::{AttachedConsumer, RouterGateway};
pub use loopback::LoopbackBoundary;
pub use ws::WsBoundary;
