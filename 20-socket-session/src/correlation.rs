//! In-flight calls waiting for their response.
//!
//! Each entry is keyed by the sequence number the call went out with. An entry
//! leaves the table exactly once: either when its response is resolved, or
//! when the whole table is cleared because the connection went away. Cleared
//! entries are dropped without being invoked.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{CallError, ServerError};

/// Caller supplied continuation for a correlated call.
pub type Callback = Box<dyn FnOnce(Result<Value, CallError>) + Send + 'static>;

/// What to do once the response for a sequence number arrives.
pub enum Continuation {
    /// Hand the outcome to the caller.
    Reply(Callback),
    /// The login issued by the engine itself on transport open.
    Login,
    /// An explicit logout; the engine closes before calling back.
    Logout(Option<Callback>),
}

/// What [`CorrelationTable::resolve`] did with a response.
pub enum Resolution {
    /// A caller's callback received the outcome.
    Replied,
    /// The engine's own login finished.
    Login(Result<Value, ServerError>),
    /// The logout finished; the engine still owes the caller its callback.
    Logout(Option<Callback>, Result<Value, ServerError>),
    /// Nothing was waiting on this sequence.
    Unmatched,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: HashMap<u64, Continuation>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers `continuation` under `sequence`, replacing any stale entry.
    pub fn register(&mut self, sequence: u64, continuation: Continuation) {
        self.entries.insert(sequence, continuation);
    }

    /// Consumes the entry for `sequence` with the server's verdict.
    ///
    /// Caller replies are invoked synchronously. Entries that belong to the
    /// engine come back together with their outcome. Unknown sequences are not
    /// an error: the response may belong to a call abandoned by a reconnect, or
    /// to a call sent without a callback.
    pub fn resolve(&mut self, sequence: u64, outcome: Result<Value, ServerError>) -> Resolution {
        match self.entries.remove(&sequence) {
            Some(Continuation::Reply(callback)) => {
                callback(outcome.map_err(CallError::from));
                Resolution::Replied
            }
            Some(Continuation::Login) => Resolution::Login(outcome),
            Some(Continuation::Logout(callback)) => Resolution::Logout(callback, outcome),
            None => Resolution::Unmatched,
        }
    }

    /// Drops every entry without invoking it.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
