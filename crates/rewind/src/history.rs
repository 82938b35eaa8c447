#![forbid(unsafe_code)]

//! Append-only invocation log, independent of the undo/redo stacks.
//!
//! Every dispatch is recorded here — nested, grouped, disabled, or
//! immediate — under a monotonically increasing key. The engine reads the
//! log back to recover original kwargs for redo/repeat and to flag failed
//! entries; UIs read it to render a history panel.
//!
//! # Invariants
//!
//! 1. Keys are strictly increasing in insertion order and never reused.
//! 2. The log holds at most `capacity` entries (after any `record`).
//! 3. Eviction removes whole leading units: a level-0 head together with
//!    its trailing `level > 0` children. The oldest remaining entry is
//!    therefore always a root-level entry.
//!
//! # Diagnostics mirror
//!
//! After each record, the last `mirror_depth` entries are string-formatted
//! and handed to an optional [`DiagnosticsSink`] (typically backed by a
//! persisted-settings store so the tail of the log survives a crash). Only
//! primitive kwargs are rendered; opaque payloads become placeholders.

use std::collections::VecDeque;
use std::fmt;

use crate::value::Kwargs;

/// Key of a recorded invocation. Monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryKey(u64);

impl HistoryKey {
    /// Raw key value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HistoryEntry {
    /// Qualified command name.
    pub name: String,
    /// Snapshot of the keyword arguments the command was built from.
    pub kwargs: Kwargs,
    /// Nesting level at dispatch time; 0 is a root invocation.
    pub level: usize,
    /// Set when the command's `apply` (or a member of its group) failed.
    pub error: bool,
}

impl HistoryEntry {
    /// Render for diagnostics: `scene.Append(x=1, y=2)`, with ` [failed]`
    /// appended for errored entries.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("{}({})", self.name, self.kwargs.render());
        if self.error {
            out.push_str(" [failed]");
        }
        out
    }
}

/// Receives the formatted tail of the log after each record.
///
/// Implementations usually forward to a crash-diagnostics store; the engine
/// never reads anything back, so a sink is not required for correctness.
pub trait DiagnosticsSink: Send {
    /// Called with the last `mirror_depth` entries, oldest first.
    fn mirror(&mut self, lines: &[String]);
}

/// Configuration for the invocation log.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum number of retained entries.
    pub capacity: usize,
    /// How many trailing entries the diagnostics mirror formats.
    pub mirror_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            mirror_depth: 5,
        }
    }
}

impl HistoryConfig {
    /// Create a configuration with a custom capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Create an unlimited configuration (for testing).
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            capacity: usize::MAX,
            mirror_depth: 5,
        }
    }
}

/// The capacity-bounded invocation log.
pub struct HistoryLog {
    /// Entries in insertion order; keys strictly increasing.
    entries: VecDeque<(HistoryKey, HistoryEntry)>,
    next_key: u64,
    config: HistoryConfig,
    sink: Option<Box<dyn DiagnosticsSink>>,
}

impl fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryLog")
            .field("len", &self.entries.len())
            .field("next_key", &self.next_key)
            .field("config", &self.config)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl HistoryLog {
    /// Create a log with the given configuration.
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            next_key: 0,
            config,
            sink: None,
        }
    }

    /// Install (or replace) the diagnostics mirror sink.
    pub fn set_sink(&mut self, sink: Box<dyn DiagnosticsSink>) {
        self.sink = Some(sink);
    }

    /// Record an invocation and return its key.
    pub fn record(&mut self, name: impl Into<String>, kwargs: Kwargs, level: usize) -> HistoryKey {
        let key = HistoryKey(self.next_key);
        self.next_key += 1;
        self.entries.push_back((
            key,
            HistoryEntry {
                name: name.into(),
                kwargs,
                level,
                error: false,
            },
        ));
        self.evict();
        self.run_mirror();
        key
    }

    /// Flag an entry as failed. Unknown (evicted) keys are ignored.
    pub fn mark_error(&mut self, key: HistoryKey) {
        if let Some(entry) = self.get_mut(key) {
            entry.error = true;
        }
    }

    /// Point lookup by key.
    #[must_use]
    pub fn get(&self, key: HistoryKey) -> Option<&HistoryEntry> {
        self.index_of(key).map(|i| &self.entries[i].1)
    }

    fn get_mut(&mut self, key: HistoryKey) -> Option<&mut HistoryEntry> {
        self.index_of(key).map(|i| &mut self.entries[i].1)
    }

    fn index_of(&self, key: HistoryKey) -> Option<usize> {
        // Keys are strictly increasing, so binary search applies.
        let i = self.entries.partition_point(|(k, _)| *k < key);
        (i < self.entries.len() && self.entries[i].0 == key).then_some(i)
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = (HistoryKey, &HistoryEntry)> {
        self.entries.iter().map(|(k, e)| (*k, e))
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry. Keys keep increasing; they are never reused.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Evict whole leading units until the capacity holds.
    ///
    /// A unit is a level-0 entry plus the contiguous `level > 0` entries
    /// following it (its nested and grouped children), so a group's
    /// children are never split from their head.
    fn evict(&mut self) {
        while self.entries.len() > self.config.capacity {
            self.entries.pop_front();
            while self
                .entries
                .front()
                .is_some_and(|(_, entry)| entry.level > 0)
            {
                self.entries.pop_front();
            }
        }
    }

    fn run_mirror(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let depth = self.config.mirror_depth.min(self.entries.len());
        let start = self.entries.len() - depth;
        let lines: Vec<String> = self
            .entries
            .iter()
            .skip(start)
            .map(|(key, entry)| format!("{key}: {}", entry.render()))
            .collect();
        sink.mirror(&lines);
    }
}

// ============================================================================
// Tests
// ============================================================================
