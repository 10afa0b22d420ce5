//! Streaming aggregation: folds response fragments into turn state.
//!
//! One [`TurnState`] lives for one epoch. Fragments are applied strictly in
//! arrival order; applying never fails, absent fields are simply skipped.

use chatloop_core::message::ToolInvocation;
use chatloop_core::provider::{StreamChunk, ToolCallDelta, Usage};
use serde::Serialize;

/// Accumulated output of the current epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnState {
    /// Concatenated text deltas
    pub content: String,

    /// Tool invocations under construction, ordered by `index`
    pub tool_calls: Vec<ToolInvocation>,

    /// Latest usage snapshot (last write wins)
    pub usage: Option<Usage>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything, ready for the next epoch.
    pub fn reset(&mut self) {
        self.content.clear();
        self.tool_calls.clear();
        self.usage = None;
    }

    /// Fold one fragment into the state.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        if let Some(text) = chunk.content.as_deref() {
            self.content.push_str(text);
        }

        for delta in &chunk.tool_calls {
            self.merge_tool_call(delta);
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }

    fn merge_tool_call(&mut self, delta: &ToolCallDelta) {
        match self.tool_calls.binary_search_by_key(&delta.index, |call| call.index) {
            Ok(pos) => {
                let call = &mut self.tool_calls[pos];
                if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
                    call.id = id.to_string();
                }
                if let Some(name) = delta.name.as_deref().filter(|name| !name.is_empty()) {
                    call.name = name.to_string();
                }
                if let Some(args) = delta.arguments.as_deref() {
                    call.arguments.push_str(args);
                }
            }
            Err(pos) => {
                self.tool_calls.insert(
                    pos,
                    ToolInvocation {
                        index: delta.index,
                        id: delta.id.clone().unwrap_or_default(),
                        name: delta.name.clone().unwrap_or_default(),
                        arguments: delta.arguments.clone().unwrap_or_default(),
                    },
                );
            }
        }
    }
}
