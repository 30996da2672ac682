//! HTTP listener, peer mesh, connection management, and shutdown control.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod mesh;
pub mod middleware;
pub mod module;
pub mod pending;
pub mod reconcile;
pub mod reconnect;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use handlers::AppState;
pub use mesh::PeerMesh;
pub use module::NetworkModule;
pub use reconcile::{bootstrap, reconcile_once, PeerDialer, PeerDirectory, ReconcileRunnable};
pub use shutdown::*;
