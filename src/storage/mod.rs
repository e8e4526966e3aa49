//! Audit sinks for model lifecycle and batch events

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemorySink;
pub use sqlite::{AuditRecord, SqliteAuditSink};
pub use traits::{record_or_warn, AuditEvent, AuditSink, BatchSummary, TracingSink};
