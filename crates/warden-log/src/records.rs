//! The persisted log record format.
//!
//! A cycle emits a sequence of quadruples `(method, seconds,
//! microseconds, args)`. The argument layout per method:
//!
//! | Method | Args |
//! |--------|------|
//! | `register_executable_plan` | `[plan_remote_id]` |
//! | `merged_plan` | `[plan_dump]` |
//! | `added_edge` | `[space, kind, from, to, info]` |
//! | `removed_edge` | `[space, kind, from, to]` |
//! | `updated_edge_info` | `[space, kind, from, to, info]` |
//! | `task_status_change` | `[task, label, flags]` |
//! | `event_status_change` | `[gen, label]` |
//! | `garbage_task` | `[task]` |
//! | `finalized_task` | `[task]` |
//! | `finalized_event` | `[gen]` |
//! | `task_arguments_updated` | `[task, arguments]` |
//! | `task_failed_to_start` | `[task, reason]` |
//! | `generator_fired` | `[gen, propagation_id, context]` |
//! | `generator_emit_failed` | `[gen, reason]` |
//! | `generator_propagate_events` | `[source_pid, target, kind]` |
//! | `generator_unreachable` | `[gen, reason]` |
//! | `exception_notification` | `[code, message, task]` |
//! | `cycle_end` | `[cycle, stats]` |
//!
//! `space` is `"event"` or `"task"`; object references are raw arena
//! ids (`u64`), which the rebuilder resolves through its id table.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Write;

/// Method tag of one log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMethod {
    /// A plan became executable under an engine.
    RegisterExecutablePlan,
    /// Full structural snapshot of the plan.
    MergedPlan,
    /// A relation edge was added.
    AddedEdge,
    /// A relation edge was removed.
    RemovedEdge,
    /// A relation edge's info payload changed.
    UpdatedEdgeInfo,
    /// A task's status flags changed.
    TaskStatusChange,
    /// A generator's status changed.
    EventStatusChange,
    /// A task was removed by garbage collection.
    GarbageTask,
    /// A task left the plan.
    FinalizedTask,
    /// A generator left the plan.
    FinalizedEvent,
    /// A task's arguments were assigned.
    TaskArgumentsUpdated,
    /// A task failed to start.
    TaskFailedToStart,
    /// A generator emitted.
    GeneratorFired,
    /// An emission attempt failed.
    GeneratorEmitFailed,
    /// An emission propagated along a signal or forward edge.
    GeneratorPropagateEvents,
    /// A generator became unreachable.
    GeneratorUnreachable,
    /// A localized error was reported.
    ExceptionNotification,
    /// End-of-cycle bookkeeping.
    CycleEnd,
}

impl fmt::Display for LogMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegisterExecutablePlan => "register_executable_plan",
            Self::MergedPlan => "merged_plan",
            Self::AddedEdge => "added_edge",
            Self::RemovedEdge => "removed_edge",
            Self::UpdatedEdgeInfo => "updated_edge_info",
            Self::TaskStatusChange => "task_status_change",
            Self::EventStatusChange => "event_status_change",
            Self::GarbageTask => "garbage_task",
            Self::FinalizedTask => "finalized_task",
            Self::FinalizedEvent => "finalized_event",
            Self::TaskArgumentsUpdated => "task_arguments_updated",
            Self::TaskFailedToStart => "task_failed_to_start",
            Self::GeneratorFired => "generator_fired",
            Self::GeneratorEmitFailed => "generator_emit_failed",
            Self::GeneratorPropagateEvents => "generator_propagate_events",
            Self::GeneratorUnreachable => "generator_unreachable",
            Self::ExceptionNotification => "exception_notification",
            Self::CycleEnd => "cycle_end",
        };
        write!(f, "{name}")
    }
}

/// One log record: `(method, seconds, microseconds, args)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The record method.
    pub method: LogMethod,
    /// Unix seconds of the record.
    pub sec: i64,
    /// Sub-second microseconds.
    pub usec: u32,
    /// Method-specific arguments.
    pub args: Vec<Value>,
}

impl LogEntry {
    /// A record stamped with the current time.
    #[must_use]
    pub fn now(method: LogMethod, args: Vec<Value>) -> Self {
        let now = Utc::now();
        Self {
            method,
            sec: now.timestamp(),
            usec: now.timestamp_subsec_micros().min(999_999),
            args,
        }
    }

    /// A record with an explicit timestamp, for replay tooling.
    #[must_use]
    pub fn at(method: LogMethod, sec: i64, usec: u32, args: Vec<Value>) -> Self {
        Self {
            method,
            sec,
            usec,
            args,
        }
    }
}

/// Consumer of the engine's log stream.
pub trait LogSink: Send {
    /// Appends one record.
    fn append(&mut self, entry: LogEntry);

    /// Flushes buffered records, if any.
    fn flush(&mut self) {}
}

/// In-memory sink, for tests and live introspection.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
}

impl MemoryLog {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffered records.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Drains the buffered records.
    pub fn take(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries)
    }
}

impl LogSink for MemoryLog {
    fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }
}

/// Sink writing one JSON record per line.
pub struct JsonLinesWriter<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    /// Wraps a writer.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Unwraps the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> LogSink for JsonLinesWriter<W> {
    fn append(&mut self, entry: LogEntry) {
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(self.writer, "{json}");
        }
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_roundtrips_through_json() {
        let entry = LogEntry::at(LogMethod::GeneratorFired, 100, 250, vec![json!(3), json!(7)]);
        let text = serde_json::to_string(&entry).unwrap();
        assert!(text.contains("generator_fired"));
        let back: LogEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method, LogMethod::GeneratorFired);
        assert_eq!(back.sec, 100);
        assert_eq!(back.usec, 250);
        assert_eq!(back.args, vec![json!(3), json!(7)]);
    }

    #[test]
    fn memory_log_buffers_in_order() {
        let mut log = MemoryLog::new();
        log.append(LogEntry::now(LogMethod::RegisterExecutablePlan, vec![]));
        log.append(LogEntry::now(LogMethod::CycleEnd, vec![json!(0)]));
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.entries()[0].method, LogMethod::RegisterExecutablePlan);
        let drained = log.take();
        assert_eq!(drained.len(), 2);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn jsonlines_writer_persists_to_disk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sink = JsonLinesWriter::new(std::fs::File::create(file.path()).unwrap());
        sink.append(LogEntry::at(
            LogMethod::GeneratorFired,
            12,
            34,
            vec![json!(1), json!(2), json!([])],
        ));
        sink.flush();
        drop(sink);

        let text = std::fs::read_to_string(file.path()).unwrap();
        let entry: LogEntry = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(entry.method, LogMethod::GeneratorFired);
        assert_eq!((entry.sec, entry.usec), (12, 34));
    }

    #[test]
    fn jsonlines_writer_produces_one_line_per_record() {
        let mut sink = JsonLinesWriter::new(Vec::new());
        sink.append(LogEntry::now(LogMethod::CycleEnd, vec![json!(1)]));
        sink.append(LogEntry::now(LogMethod::CycleEnd, vec![json!(2)]));
        sink.flush();
        let buffer = sink.into_inner();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), 2);
        for line in text.lines() {
            let _: LogEntry = serde_json::from_str(line).unwrap();
        }
    }
}
