//! Orbit core: command names, wire envelopes, service manifests, and the task model.
//!
//! Everything here is transport-free. The server crate builds the command
//! bus, both RPC transports, the service registry, and the scheduler on top
//! of these types.

pub mod command;
pub mod manifest;
pub mod messages;
pub mod recurrence;
pub mod schema;
pub mod task;

pub use command::CommandName;
pub use manifest::{ServiceManifest, ServiceRecord, ServiceRegistration};
pub use messages::{
    BrokerEnvelope, BrokerReply, MeshFrame, MeshRequest, MeshResponse, METHOD_NOT_FOUND,
    SERVICE_NAME_HEADER,
};
pub use recurrence::{next_occurrence, RecurrenceError};
pub use schema::{task_schema, ValidationResult, TASK_SCHEMA_NAME};
pub use task::{
    RecurringInterval, ScheduleTaskRequest, ScheduledAt, Task, TaskStatus, TaskValidationError,
};
