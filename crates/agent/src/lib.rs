//! The conversation task loop: the heart of chatloop.
//!
//! Each epoch follows a **Request → Stream → Act** cycle:
//!
//! 1. **Build** a request (system prompt + recent transcript + tool schemas)
//! 2. **Stream** the exchange over the message bridge, folding fragments
//!    into the turn state as they arrive
//! 3. **If tool calls**: dispatch them, append the results, loop back to 1
//! 4. **If text**: append the final answer and stop
//!
//! The loop stops on a final answer, an empty exchange, a transport error,
//! a missing credential, an exhausted parse-retry budget, or after
//! `max_epochs` exchanges.

pub mod aggregator;
pub mod dispatcher;
pub mod task_loop;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use aggregator::TurnState;
pub use dispatcher::{DispatchOutcome, ToolDispatcher};
pub use chatloop_core::settings::ToolCallPolicy;
pub use task_loop::{LoopSummary, StopReason, TaskLoop, TaskLoopOptions};
pub use transport::{
    ConversationTransport, ExchangeEvent, ExchangeObserver, ExchangeOutcome, ExchangeSubscription,
};
