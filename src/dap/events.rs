//! Events synthesized by the bridge rather than relayed from the debuggee.

use serde::{Deserialize, Serialize};

/// Stream a chunk of debuggee output was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Body of an `output` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBody {
    /// Originating stream.
    pub category: OutputCategory,
    /// Output text, unmodified.
    pub output: String,
}

/// `{ "type": "event", "event": "output", "body": { .. } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Always `event`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Always `output`.
    pub event: String,
    /// Category and text.
    pub body: OutputBody,
}

impl OutputEvent {
    /// Build an output event for one chunk of debuggee output.
    #[must_use]
    pub fn new(category: OutputCategory, output: impl Into<String>) -> Self {
        Self {
            kind: "event".into(),
            event: "output".into(),
            body: OutputBody {
                category,
                output: output.into(),
            },
        }
    }

    /// Serialize to the JSON text frame sent to the client.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"event","event":"output","body":{"category":"stderr","output":""}}"#
                .to_owned()
        })
    }
}
