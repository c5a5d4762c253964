//! Layered compliance policies, outbound gating, audit, and replay.

pub mod center;
pub mod policy;

pub use center::{AuditRow, ComplianceCenter, ComplianceDecision};
pub use policy::PolicyFile;
