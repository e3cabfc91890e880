use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::task::lookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialMode {
    /// Append to what has been shown so far.
    Delta,
    /// Replace what has been shown so far.
    Partial,
    /// Terminal value for this round.
    Final,
}

/// One streamed fragment, read from `response.partial` of a `partial` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialChunk {
    pub mode: PartialMode,
    #[serde(default)]
    pub text: String,
}

impl PartialChunk {
    pub fn new(mode: PartialMode, text: impl Into<String>) -> Self {
        Self { mode, text: text.into() }
    }

    pub fn from_task(task: &Value) -> Option<Self> {
        let raw = lookup(task, "response.partial")?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Accumulates streamed output for display. A `final` ends the round: the
/// next `delta` starts from empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialAccumulator {
    text: String,
    finished: bool,
}

impl PartialAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &PartialChunk) -> &str {
        match chunk.mode {
            PartialMode::Delta => {
                if self.finished {
                    self.text.clear();
                    self.finished = false;
                }
                self.text.push_str(&chunk.text);
            }
            PartialMode::Partial => {
                self.text = chunk.text.clone();
                self.finished = false;
            }
            PartialMode::Final => {
                self.text = chunk.text.clone();
                self.finished = true;
            }
        }
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_final(&self) -> bool {
        self.finished
    }
}
