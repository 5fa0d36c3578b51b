//! Tracing, correlation IDs and the structured audit log.

pub mod audit;
pub mod tracing;

pub use audit::{AuditEvent, AuditKind, AuditLogger, AuditWriter, sanitize_payload};
pub use tracing::{init_tracing, CorrelationId};
