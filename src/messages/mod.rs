//! Message service: intent classification, reply composition, outbound
//! policies, and the read-no-reply follow-up pass.

pub mod followup;
pub mod intent;
pub mod outbound;
pub mod service;

pub use service::{AutoReplyReport, MessageService, ProcessOutcome, SessionProcessor};
