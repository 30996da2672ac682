//! Wire formats shared by every node.
//!
//! - [`broker`]: the `{method, data}` envelope and its reply shapes
//! - [`mesh`]: request/response frames exchanged over peer sockets

pub mod broker;
pub mod mesh;

pub use broker::{BrokerEnvelope, BrokerReply, METHOD_NOT_FOUND};
pub use mesh::{MeshFrame, MeshRequest, MeshResponse, SERVICE_NAME_HEADER};
