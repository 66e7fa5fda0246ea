//! Per-want bounded history: state commits, parameter changes, logs and
//! agent executions, each in its own ring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ring::RingBuffer;
use crate::state::StateMap;

pub const STATE_HISTORY_CAPACITY: usize = 200;
pub const PARAMETER_HISTORY_CAPACITY: usize = 50;
pub const LOG_HISTORY_CAPACITY: usize = 100;
pub const AGENT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// Committed state with internal (`_`-prefixed) keys removed.
    pub state: StateMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub params: StateMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogHistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// Lines from one progress cycle, joined with newlines.
    pub lines: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentRunStatus {
    Running,
    Achieved,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHistoryEntry {
    /// Shared between the `running` entry and its terminal counterpart.
    pub execution_id: Uuid,
    pub agent_name: String,
    pub status: AgentRunStatus,
    pub timestamp: DateTime<Utc>,
}

/// The four bounded history rings of a want.
#[derive(Debug)]
pub struct WantHistory {
    pub state: RingBuffer<StateHistoryEntry>,
    pub parameters: RingBuffer<ParameterHistoryEntry>,
    pub logs: RingBuffer<LogHistoryEntry>,
    pub agents: RingBuffer<AgentHistoryEntry>,
}

impl WantHistory {
    pub fn new() -> Self {
        Self {
            state: RingBuffer::new(STATE_HISTORY_CAPACITY),
            parameters: RingBuffer::new(PARAMETER_HISTORY_CAPACITY),
            logs: RingBuffer::new(LOG_HISTORY_CAPACITY),
            agents: RingBuffer::new(AGENT_HISTORY_CAPACITY),
        }
    }

    pub fn clear(&self) {
        self.state.clear();
        self.parameters.clear();
        self.logs.clear();
        self.agents.clear();
    }

    pub fn to_snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            state: self.state.snapshot(0),
            parameters: self.parameters.snapshot(0),
            logs: self.logs.snapshot(0),
            agents: self.agents.snapshot(0),
        }
    }

    pub fn restore(&self, snapshot: HistorySnapshot) {
        self.clear();
        for e in snapshot.state {
            self.state.append(e);
        }
        for e in snapshot.parameters {
            self.parameters.append(e);
        }
        for e in snapshot.logs {
            self.logs.append(e);
        }
        for e in snapshot.agents {
            self.agents.append(e);
        }
    }
}

impl Default for WantHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Flat serializable form of the history rings, FIFO order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    #[serde(default)]
    pub state: Vec<StateHistoryEntry>,
    #[serde(default)]
    pub parameters: Vec<ParameterHistoryEntry>,
    #[serde(default)]
    pub logs: Vec<LogHistoryEntry>,
    #[serde(default)]
    pub agents: Vec<AgentHistoryEntry>,
}
