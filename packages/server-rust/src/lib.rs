//! Orbit server: a command bus that routes calls locally, over a peer
//! `WebSocket` mesh, or through a message broker, plus the control node's
//! service registry and task scheduler.

pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use bus::{handler_fn, CommandBus, ExecuteOptions, HandlerResult, TransportKind};
pub use config::{BrokerConfig, DeploymentMode, Environment, NodeConfig, SchedulerConfig, StorageConfig};
pub use error::RouterError;
pub use node::Node;
pub use registry::ServiceRegistry;
pub use scheduler::TaskScheduler;
