//! The decision-record path.
//!
//! Every pipeline run with `create_decisions` enabled emits a decision
//! record documenting the ranking and the per-step reasoning behind it.
//! Records flow through a bounded queue into the resource store and are
//! reaped by the TTL reconciler after their lifetime expires. The queue
//! never blocks the request hot path: when it is full, the record is
//! dropped and a counter bumped.

pub mod record;
pub mod ttl;
pub mod writer;

pub use record::DecisionRecord;
pub use ttl::{ReapAction, ReaperHandle, TtlReaper};
pub use writer::{DecisionSink, DecisionWriter};
