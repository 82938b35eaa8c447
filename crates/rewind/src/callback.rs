#![forbid(unsafe_code)]

//! Pre/post execution observers.
//!
//! Observers are keyed by canonical qualified command name and phase, kept
//! in registration order, and removable individually through the opaque
//! [`CallbackToken`] handed out at registration. Observers receive an
//! immutable [`CallbackInfo`] snapshot; the argument map inside it is
//! already the command's derived view (see
//! [`Cmd::callback_info`](crate::Cmd::callback_info)), never the engine's
//! own copy.

use std::collections::HashMap;
use std::fmt;

use crate::command::CallbackPhase;
use crate::value::Kwargs;

/// Opaque handle identifying one observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

/// What an observer sees for one dispatch.
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    /// Qualified command name.
    pub name: String,
    /// Which side of `apply` this is.
    pub phase: CallbackPhase,
    /// The command's derived argument snapshot.
    pub kwargs: Kwargs,
}

type Observer = Box<dyn FnMut(&CallbackInfo) + Send>;

/// Ordered observer lists keyed by `(qualified name, phase)`.
#[derive(Default)]
pub struct CallbackRegistry {
    observers: HashMap<(String, CallbackPhase), Vec<(CallbackToken, Observer)>>,
    next_token: u64,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.observers.values().map(Vec::len).sum();
        f.debug_struct("CallbackRegistry")
            .field("keys", &self.observers.len())
            .field("observers", &total)
            .finish()
    }
}

impl CallbackRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for a command and phase.
    pub fn register<F>(&mut self, name: &str, phase: CallbackPhase, observer: F) -> CallbackToken
    where
        F: FnMut(&CallbackInfo) + Send + 'static,
    {
        let token = CallbackToken(self.next_token);
        self.next_token += 1;
        self.observers
            .entry((name.to_string(), phase))
            .or_default()
            .push((token, Box::new(observer)));
        token
    }

    /// Remove exactly the registration that produced `token`.
    ///
    /// Returns false (and logs) for unknown tokens.
    pub fn unregister(&mut self, token: CallbackToken) -> bool {
        for list in self.observers.values_mut() {
            if let Some(i) = list.iter().position(|(t, _)| *t == token) {
                list.remove(i);
                return true;
            }
        }
        tracing::error!(token = token.0, "unregister_callback: unknown token");
        false
    }

    /// Drop every observer registered against a command. Called when the
    /// command itself is unregistered.
    pub fn remove_command(&mut self, name: &str) {
        self.observers.retain(|(n, _), _| n != name);
    }

    /// Invoke the observers for `(info.name, info.phase)` in registration
    /// order.
    pub fn fire(&mut self, info: &CallbackInfo) {
        let key = (info.name.clone(), info.phase);
        if let Some(list) = self.observers.get_mut(&key) {
            for (_, observer) in list.iter_mut() {
                observer(info);
            }
        }
    }

    /// Total number of registered observers (for tests and introspection).
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.values().map(Vec::len).sum()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
