//! Durable workflow: session state machine, job queue with leases, SLA
//! monitoring, and the resident worker loop.

pub mod sla;
pub mod state;
pub mod store;
pub mod worker;

pub use state::{SessionStateMachine, WorkflowState};
pub use store::{SessionContext, WorkflowJob, WorkflowStore};
pub use worker::WorkflowWorker;
