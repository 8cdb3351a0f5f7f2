use std::fmt;
use std::sync::Arc;

/// Default upper bound on the number of stage boundaries an event may cross
/// when history tracking is enabled.
pub const DEFAULT_MAX_EVENT_HOPS: u32 = 100;

/// How an event crossed into a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Handle,
    Callback,
    Timeout,
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle => write!(f, "handle"),
            Self::Callback => write!(f, "callback"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Event history settings for a thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHistoryConfig {
    pub enabled: bool,
    pub max_hops: u32,
}

impl EventHistoryConfig {
    pub const fn disabled() -> Self {
        EventHistoryConfig {
            enabled: false,
            max_hops: DEFAULT_MAX_EVENT_HOPS,
        }
    }

    pub const fn enabled(max_hops: u32) -> Self {
        EventHistoryConfig {
            enabled: true,
            max_hops,
        }
    }
}

impl Default for EventHistoryConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub stage: Arc<str>,
    pub kind: HistoryKind,
}

/// Stages an event has visited.
#[derive(Debug, Clone, Default)]
pub struct EventHistory {
    entries: Vec<HistoryEntry>,
    hops: u32,
}

impl EventHistory {
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    /// Record a stage crossing.
    ///
    /// Panics if the event crossed more than `max_hops` stage boundaries,
    /// which indicates a cycle in the pipeline.
    pub fn record(&mut self, stage: &Arc<str>, kind: HistoryKind, max_hops: u32) {
        self.entries.push(HistoryEntry {
            stage: stage.clone(),
            kind,
        });
        self.hops += 1;

        assert!(
            self.hops <= max_hops,
            "Event exceeded max hops ({max_hops}), last stage: {stage} ({kind})"
        );
    }
}
