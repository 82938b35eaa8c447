#![forbid(unsafe_code)]

//! Name → command-definition lookup.
//!
//! Registrations are keyed by `(canonical short name, module)`. The short
//! name is the registered name with a trailing `"Command"` stripped, so
//! `scene::AppendCommand` and `execute("Append", ..)` meet in the middle.
//!
//! # Resolution rules
//!
//! - A short name with exactly one implementation resolves regardless of
//!   any qualifier in the lookup string.
//! - A short name registered by several modules requires a `module.Name`
//!   qualifier; a bare lookup fails as ambiguous.
//! - If the literal lookup fails and the name ends in `"Command"`, the
//!   lookup is retried with the suffix stripped (backward compatibility
//!   with callers that pass implementation type names).
//!
//! # Invariants
//!
//! - Registering the same `(name, module)` twice replaces the definition
//!   without error (last write wins) and notifies subscribers.
//! - Unregistration notifies subscribers even when nothing was removed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::command::CommandDef;
use crate::engine::{Engine, SubscriptionId};
use crate::error::CommandError;
use crate::value::{ArgValue, Kwargs};

/// Splits `a.b.Name` into `("a.b", "Name")`; no dot means no qualifier.
fn split_qualified(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((module, short)) => (module, short),
        None => ("", name),
    }
}

/// Registry of command definitions.
#[derive(Default)]
pub struct CommandRegistry {
    /// short name → module → definition.
    commands: BTreeMap<String, BTreeMap<String, Arc<CommandDef>>>,
    subscribers: Vec<(SubscriptionId, Box<dyn FnMut() + Send>)>,
    next_sub: u64,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: usize = self.commands.values().map(BTreeMap::len).sum();
        f.debug_struct("CommandRegistry")
            .field("commands", &total)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl CommandRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under `(canonical name, module)`.
    ///
    /// Re-registering the same pair replaces the previous definition.
    /// Returns false (and logs) for an empty name.
    pub fn register(&mut self, def: CommandDef) -> bool {
        if def.raw_name().is_empty() {
            tracing::error!(module = def.module(), "register: empty command name");
            return false;
        }
        let short = def.canonical_name().to_string();
        let module = def.module().to_string();
        let replaced = self
            .commands
            .entry(short.clone())
            .or_default()
            .insert(module.clone(), Arc::new(def));
        if replaced.is_some() {
            tracing::debug!(name = %short, module = %module, "register: replaced definition");
        }
        self.notify();
        true
    }

    /// Remove the definition `name` resolves to.
    ///
    /// Returns the removed definition so the engine can drop callbacks
    /// registered against it; logs and returns `None` when nothing matches.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<CommandDef>> {
        let def = match self.resolve(name) {
            Ok(def) => def,
            Err(err) => {
                tracing::error!(name, error = %err, "unregister failed");
                return None;
            }
        };
        let short = def.canonical_name().to_string();
        let module = def.module().to_string();
        if let Some(by_module) = self.commands.get_mut(&short) {
            by_module.remove(&module);
            if by_module.is_empty() {
                self.commands.remove(&short);
            }
        }
        self.notify();
        Some(def)
    }

    /// Resolve a (possibly qualified) name to a definition.
    pub fn resolve(&self, name: &str) -> Result<Arc<CommandDef>, CommandError> {
        match self.lookup(name) {
            Err(CommandError::NotFound(_)) => {
                // Callers may pass the implementation name with the
                // conventional suffix still attached.
                match name.strip_suffix("Command") {
                    Some(stripped) if !stripped.is_empty() => self.lookup(stripped),
                    _ => Err(CommandError::NotFound(name.to_string())),
                }
            }
            other => other,
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<CommandDef>, CommandError> {
        let (qualifier, short) = split_qualified(name);
        let Some(by_module) = self.commands.get(short) else {
            return Err(CommandError::NotFound(name.to_string()));
        };
        if by_module.len() == 1 {
            // A unique implementation wins regardless of qualifier.
            let def = by_module.values().next().cloned();
            return def.ok_or_else(|| CommandError::NotFound(name.to_string()));
        }
        if !qualifier.is_empty() {
            if let Some(def) = by_module.get(qualifier) {
                return Ok(def.clone());
            }
        }
        Err(CommandError::Ambiguous {
            name: short.to_string(),
            modules: by_module.keys().cloned().collect(),
        })
    }

    /// Qualified names of every registered command, sorted.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        self.commands
            .values()
            .flat_map(|by_module| by_module.values().map(|def| def.qualified_name()))
            .collect()
    }

    /// Subscribe to registration changes.
    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        let id = SubscriptionId::registry(self.next_sub);
        self.next_sub += 1;
        self.subscribers.push((id, Box::new(observer)));
        id
    }

    /// Remove a registration-change subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        before != self.subscribers.len()
    }

    fn notify(&mut self) {
        for (_, observer) in &mut self.subscribers {
            observer();
        }
    }
}

/// Convenience accessor returned by [`register_module`]: one callable per
/// registered command, forwarding to `execute` with the module qualifier
/// attached.
pub struct ModuleCommands {
    engine: Arc<Mutex<Engine>>,
    module: String,
    names: Vec<String>,
    immediates: Vec<String>,
}

impl fmt::Debug for ModuleCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCommands")
            .field("module", &self.module)
            .field("names", &self.names)
            .field("immediates", &self.immediates)
            .finish()
    }
}

impl ModuleCommands {
    /// Canonical short names registered through this accessor.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Execute `module.short` with the given kwargs.
    pub fn call(&self, short: &str, kwargs: Kwargs) -> (bool, Option<ArgValue>) {
        let qualified = format!("{}.{short}", self.module);
        match self.engine.lock() {
            Ok(mut engine) => engine.execute(&qualified, kwargs),
            Err(_) => {
                tracing::error!(command = %qualified, "engine lock poisoned");
                (false, None)
            }
        }
    }

    /// Execute a command flagged immediate inside a disabled scope: it
    /// runs and is logged, but leaves no undo entry.
    pub fn immediate(&self, short: &str, kwargs: Kwargs) -> (bool, Option<ArgValue>) {
        if !self.immediates.iter().any(|n| n == short) {
            tracing::error!(
                module = %self.module,
                command = short,
                "no immediate entry point registered"
            );
            return (false, None);
        }
        let qualified = format!("{}.{short}", self.module);
        match self.engine.lock() {
            Ok(mut engine) => {
                engine.begin_disabled();
                let out = engine.execute(&qualified, kwargs);
                engine.end_disabled();
                out
            }
            Err(_) => {
                tracing::error!(command = %qualified, "engine lock poisoned");
                (false, None)
            }
        }
    }
}

/// Register a batch of definitions under one module and return the
/// accessor surface over `execute`.
///
/// Definitions carrying a different module id are re-homed under `module`.
pub fn register_module(
    engine: &Arc<Mutex<Engine>>,
    module: &str,
    defs: Vec<CommandDef>,
) -> ModuleCommands {
    let mut names = Vec::new();
    let mut immediates = Vec::new();
    if let Ok(mut locked) = engine.lock() {
        for def in defs {
            let def = def.rehome(module);
            let name = def.canonical_name().to_string();
            if def.is_immediate() {
                immediates.push(name.clone());
            }
            if locked.register(def) && !names.contains(&name) {
                names.push(name);
            }
        }
    } else {
        tracing::error!(module, "engine lock poisoned; nothing registered");
    }
    ModuleCommands {
        engine: engine.clone(),
        module: module.to_string(),
        names,
        immediates,
    }
}

// ============================================================================
// Tests
// ============================================================================
