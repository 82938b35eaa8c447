#![forbid(unsafe_code)]

//! The command execution engine: dispatch, undo/redo stacks, grouping,
//! disabled scopes, and change notifications.
//!
//! One [`Engine`] owns every piece of session state — registry, observer
//! lists, invocation log, both stacks, and the level/group/disabled
//! counters — so independent engines (one per test, one per session) never
//! share anything through hidden globals.
//!
//! # State machine
//!
//! ```text
//! execute(name, kwargs)
//!   └─ resolve ─ build ─ dispatch
//!        ├─ history.record(name, kwargs, level)      (always, first)
//!        ├─ level += 1 .. level -= 1                 (matched, error or not)
//!        ├─ transactional path (enabled + undoable):
//!        │    clear redo (root, non-replay only) → push entry →
//!        │    pre observers → apply → post observers
//!        │    on error: revert every entry from the top down to and
//!        │    including this one, mark history entries, propagate
//!        └─ immediate path (disabled or one-shot):
//!             pre observers → apply → post observers, no stack contact
//! ```
//!
//! # Invariants
//!
//! 1. Every `level` increment on dispatch entry has exactly one matching
//!    decrement on exit, including error paths.
//! 2. An entry lives on at most one of the two stacks at any time.
//! 3. The redo stack is cleared only by root-level, non-replay dispatches
//!    (and by `clear_stacks`); nested, grouped, redone, and repeated
//!    executions preserve sibling redo state.
//! 4. A batch's notifications fire only after its terminal call resolves;
//!    undo and redo both produce exactly one notification per logical unit.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use web_time::Instant;

use crate::callback::{CallbackInfo, CallbackRegistry, CallbackToken};
use crate::command::{AnyCmd, CallbackPhase, Cmd, CommandDef, UndoableCmd};
use crate::error::{CommandError, CommandResult};
use crate::history::{DiagnosticsSink, HistoryConfig, HistoryEntry, HistoryKey, HistoryLog};
use crate::registry::CommandRegistry;
use crate::value::{ArgValue, Kwargs};

/// Module id of the engine's built-in commands.
pub const BUILTIN_MODULE: &str = "rewind";
/// Qualified name recorded for synthetic group entries.
pub const GROUP_COMMAND: &str = "rewind.Group";

/// Engine construction parameters.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Invocation-log settings (capacity, diagnostics mirror depth).
    pub history: HistoryConfig,
}

impl EngineConfig {
    /// Configuration without history bounds (for testing).
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            history: HistoryConfig::unlimited(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubscriptionKind {
    Registry,
    Change,
    ChangeDetailed,
}

/// Opaque handle for change subscriptions (simple, detailed, registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    kind: SubscriptionKind,
    seq: u64,
}

impl SubscriptionId {
    pub(crate) fn registry(seq: u64) -> Self {
        Self {
            kind: SubscriptionKind::Registry,
            seq,
        }
    }

    fn change(seq: u64) -> Self {
        Self {
            kind: SubscriptionKind::Change,
            seq,
        }
    }

    fn detailed(seq: u64) -> Self {
        Self {
            kind: SubscriptionKind::ChangeDetailed,
            seq,
        }
    }
}

type SharedCmd = Arc<Mutex<AnyCmd>>;

/// One executed command on the undo or redo stack.
struct StackEntry {
    command: SharedCmd,
    name: String,
    level: usize,
    history_key: HistoryKey,
    timestamp: Instant,
}

/// The outermost open group, between `begin_group` and `end_group`.
struct OpenGroup {
    command: SharedCmd,
    key: HistoryKey,
    level: usize,
}

/// One captured member of a closed group, replayable through dispatch.
#[derive(Clone)]
struct ReplayItem {
    command: SharedCmd,
    name: String,
    kwargs: Kwargs,
}

/// Synthetic command backing a group entry.
///
/// `apply` is lazily bound: empty at `begin_group`, filled with the
/// captured member list at `end_group`. `revert` is a no-op because the
/// members sit above the group on the undo stack and revert individually.
#[derive(Default)]
struct GroupCmd {
    captured: Vec<ReplayItem>,
}

impl GroupCmd {
    fn clone_captured(&self) -> Self {
        Self {
            captured: self.captured.clone(),
        }
    }
}

impl Cmd for GroupCmd {
    fn apply(&mut self, host: &mut Engine) -> CommandResult {
        for item in &self.captured {
            host.dispatch(item.command.clone(), &item.name, item.kwargs.clone())?;
        }
        Ok(None)
    }

    fn debug_name(&self) -> &'static str {
        "GroupCmd"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl UndoableCmd for GroupCmd {
    fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Adapter so external callers can drive `undo` through `execute`.
struct UndoCmd;

impl Cmd for UndoCmd {
    fn apply(&mut self, host: &mut Engine) -> CommandResult {
        Ok(Some(ArgValue::Bool(host.undo())))
    }

    fn debug_name(&self) -> &'static str {
        "UndoCmd"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Adapter so external callers can drive `redo` through `execute`.
struct RedoCmd;

impl Cmd for RedoCmd {
    fn apply(&mut self, host: &mut Engine) -> CommandResult {
        Ok(Some(ArgValue::Bool(host.redo())))
    }

    fn debug_name(&self) -> &'static str {
        "RedoCmd"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Adapter so external callers can drive `repeat` through `execute`.
struct RepeatCmd;

impl Cmd for RepeatCmd {
    fn apply(&mut self, host: &mut Engine) -> CommandResult {
        Ok(Some(ArgValue::Bool(host.repeat())))
    }

    fn debug_name(&self) -> &'static str {
        "RepeatCmd"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

type ChangeObserver = Box<dyn FnMut(&[String]) + Send>;
type DetailedObserver = Box<dyn FnMut(&[HistoryEntry]) + Send>;

/// The transactional command engine.
pub struct Engine {
    registry: CommandRegistry,
    callbacks: CallbackRegistry,
    history: HistoryLog,
    undo_stack: Vec<StackEntry>,
    redo_stack: Vec<StackEntry>,
    /// Nesting depth of in-flight dispatches; 0 means idle.
    level: usize,
    /// Reentrancy counter for begin/end group pairs.
    group_depth: usize,
    open_group: Option<OpenGroup>,
    /// Reentrancy counter for disabled scopes.
    disabled_depth: usize,
    /// Set while a redo replay is in flight.
    redoing: bool,
    /// Set while a repeat replay is in flight.
    repeating: bool,
    /// While a replay is in flight, per-dispatch notifications collect
    /// here and flush as one combined batch when the replay resolves.
    replay_notices: Option<(Vec<String>, Vec<HistoryKey>)>,
    change_subs: Vec<(SubscriptionId, ChangeObserver)>,
    detailed_subs: Vec<(SubscriptionId, DetailedObserver)>,
    next_sub: u64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("undo_depth", &self.undo_stack.len())
            .field("redo_depth", &self.redo_stack.len())
            .field("level", &self.level)
            .field("group_depth", &self.group_depth)
            .field("disabled_depth", &self.disabled_depth)
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Instance locks are uncontended by construction (one logical execution
/// thread), so a held lock means the command is its own caller. Blocking
/// would deadlock; every acquisition is a `try_lock` that degrades to an
/// error instead.
fn lock(command: &SharedCmd) -> Result<MutexGuard<'_, AnyCmd>, CommandError> {
    match command.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(_)) => Err(CommandError::Internal(
            "command instance lock poisoned".to_string(),
        )),
        Err(TryLockError::WouldBlock) => Err(CommandError::Internal(
            "command instance is already executing".to_string(),
        )),
    }
}

impl Engine {
    /// Create an engine and register the built-in `Undo`/`Redo`/`Repeat`
    /// adapters under the [`BUILTIN_MODULE`] module.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let mut engine = Self {
            registry: CommandRegistry::new(),
            callbacks: CallbackRegistry::new(),
            history: HistoryLog::new(config.history),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            level: 0,
            group_depth: 0,
            open_group: None,
            disabled_depth: 0,
            redoing: false,
            repeating: false,
            replay_notices: None,
            change_subs: Vec::new(),
            detailed_subs: Vec::new(),
            next_sub: 0,
        };
        engine.register(CommandDef::new(BUILTIN_MODULE, "Undo", |_| {
            Ok(AnyCmd::Immediate(Box::new(UndoCmd)))
        }));
        engine.register(CommandDef::new(BUILTIN_MODULE, "Redo", |_| {
            Ok(AnyCmd::Immediate(Box::new(RedoCmd)))
        }));
        engine.register(CommandDef::new(BUILTIN_MODULE, "Repeat", |_| {
            Ok(AnyCmd::Immediate(Box::new(RepeatCmd)))
        }));
        engine
    }

    // ========================================================================
    // Registry surface
    // ========================================================================

    /// Register a command definition. See [`CommandRegistry::register`].
    pub fn register(&mut self, def: CommandDef) -> bool {
        self.registry.register(def)
    }

    /// Unregister the command `name` resolves to, dropping any observers
    /// registered against it.
    pub fn unregister(&mut self, name: &str) -> bool {
        match self.registry.unregister(name) {
            Some(def) => {
                self.callbacks.remove_command(&def.qualified_name());
                true
            }
            None => false,
        }
    }

    /// Resolve a name to its definition.
    pub fn resolve(&self, name: &str) -> Result<Arc<CommandDef>, CommandError> {
        self.registry.resolve(name)
    }

    /// Qualified names of every registered command, sorted.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        self.registry.command_names()
    }

    /// Subscribe to command (un)registration.
    pub fn subscribe_on_registry_change<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        self.registry.subscribe(observer)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute a command by name.
    ///
    /// All failures — unknown name, ambiguity, construction, execution —
    /// are logged and reported as `(false, None)`; they never propagate.
    pub fn execute(&mut self, name: &str, kwargs: Kwargs) -> (bool, Option<ArgValue>) {
        match self.try_execute(name, kwargs) {
            Ok(value) => (true, value),
            Err(err) => {
                tracing::error!(command = name, error = %err, "execute failed");
                (false, None)
            }
        }
    }

    /// Execute a command by name, propagating the failure kind.
    pub fn try_execute(&mut self, name: &str, kwargs: Kwargs) -> CommandResult {
        let def = self.registry.resolve(name)?;
        let instance = def.build(&kwargs)?;
        let qualified = def.qualified_name();
        self.dispatch(Arc::new(Mutex::new(instance)), &qualified, kwargs)
    }

    /// Execute a command from a positional argument vector.
    ///
    /// Kwargs come from the definition's argv parser hook, or are
    /// synthesized from its declared schema. A vector that cannot be
    /// parsed fails the call; it is not silently downgraded to an empty
    /// argument map.
    pub fn execute_argv(&mut self, name: &str, argv: &[String]) -> (bool, Option<ArgValue>) {
        let parsed = self
            .registry
            .resolve(name)
            .and_then(|def| def.parse_argv(argv));
        match parsed {
            Ok(kwargs) => self.execute(name, kwargs),
            Err(err) => {
                tracing::error!(command = name, error = %err, "execute_argv failed");
                (false, None)
            }
        }
    }

    /// Run one command instance through the state machine.
    ///
    /// Also the replay entry point for groups, redo, and repeat.
    fn dispatch(&mut self, command: SharedCmd, name: &str, kwargs: Kwargs) -> CommandResult {
        let entry_level = self.level;
        let key = self.history.record(name, kwargs.clone(), entry_level);
        self.level += 1;
        let result = self.dispatch_at(&command, name, &kwargs, entry_level, key);
        self.level -= 1;
        match result {
            Ok(value) => {
                match self.replay_notices.as_mut() {
                    // A replay notifies once for the whole unit, not per
                    // member dispatch; collect until the replay resolves.
                    Some((names, keys)) => {
                        names.push(name.to_string());
                        keys.push(key);
                    }
                    None => self.notify_changed(&[name.to_string()], &[key]),
                }
                Ok(value)
            }
            Err(err) => {
                self.history.mark_error(key);
                if let Some(group) = &self.open_group {
                    let group_key = group.key;
                    self.history.mark_error(group_key);
                }
                Err(err)
            }
        }
    }

    fn dispatch_at(
        &mut self,
        command: &SharedCmd,
        name: &str,
        kwargs: &Kwargs,
        entry_level: usize,
        key: HistoryKey,
    ) -> CommandResult {
        let undoable = lock(command)?.is_undoable();
        let transactional = undoable && self.disabled_depth == 0;

        if transactional {
            if entry_level == 0 && !self.redoing && !self.repeating {
                self.redo_stack.clear();
            }
            self.undo_stack.push(StackEntry {
                command: command.clone(),
                name: name.to_string(),
                level: entry_level,
                history_key: key,
                timestamp: Instant::now(),
            });
        }

        self.fire_phase(command, name, CallbackPhase::Pre, kwargs);
        let applied = {
            let mut instance = lock(command)?;
            instance.apply(self)
        };
        match applied {
            Ok(value) => {
                self.fire_phase(command, name, CallbackPhase::Post, kwargs);
                Ok(value)
            }
            Err(err) => {
                if transactional {
                    self.unwind_through(command, key);
                }
                Err(err)
            }
        }
    }

    /// Revert and drop every entry pushed after — and including — the
    /// failing one, deepest first. Individual revert failures are logged
    /// and do not stop the unwind.
    fn unwind_through(&mut self, command: &SharedCmd, key: HistoryKey) {
        while let Some(entry) = self.undo_stack.pop() {
            let is_target = Arc::ptr_eq(&entry.command, command) && entry.history_key == key;
            match entry.command.try_lock() {
                Ok(mut instance) => {
                    if let Err(err) = instance.revert(self) {
                        tracing::error!(
                            command = %entry.name,
                            error = %err,
                            "revert failed during unwind"
                        );
                    }
                }
                Err(TryLockError::WouldBlock) => {
                    tracing::error!(
                        command = %entry.name,
                        "unwind: command is still executing; revert skipped"
                    );
                }
                Err(TryLockError::Poisoned(_)) => {
                    tracing::error!(command = %entry.name, "instance lock poisoned during unwind");
                }
            }
            if is_target {
                break;
            }
        }
    }

    fn fire_phase(&mut self, command: &SharedCmd, name: &str, phase: CallbackPhase, kwargs: &Kwargs) {
        let derived = match command.try_lock() {
            Ok(instance) => instance.callback_info(phase, kwargs),
            Err(_) => {
                tracing::error!(
                    command = name,
                    "instance unavailable; observers get raw kwargs"
                );
                kwargs.clone()
            }
        };
        let info = CallbackInfo {
            name: name.to_string(),
            phase,
            kwargs: derived,
        };
        self.callbacks.fire(&info);
    }

    // ========================================================================
    // Undo / redo / repeat
    // ========================================================================

    /// Undo the most recent root-level unit.
    ///
    /// Pops and reverts entries (deepest first) until and including the
    /// first level-0 entry; only that entry moves to the redo stack.
    /// Returns false on an empty stack. One combined change notification
    /// covers the whole popped batch.
    pub fn undo(&mut self) -> bool {
        if self.undo_stack.is_empty() {
            tracing::warn!("undo: stack is empty");
            return false;
        }
        let mut popped: Vec<StackEntry> = Vec::new();
        while let Some(entry) = self.undo_stack.pop() {
            match entry.command.try_lock() {
                Ok(mut instance) => {
                    if let Err(err) = instance.revert(self) {
                        tracing::error!(command = %entry.name, error = %err, "undo: revert failed");
                    }
                }
                // A command undoing itself mid-apply: popping proceeds,
                // its own revert cannot run.
                Err(TryLockError::WouldBlock) => {
                    tracing::error!(
                        command = %entry.name,
                        "undo: command is still executing; revert skipped"
                    );
                }
                Err(TryLockError::Poisoned(_)) => {
                    tracing::error!(command = %entry.name, "undo: instance lock poisoned");
                }
            }
            let at_root = entry.level == 0;
            popped.push(entry);
            if at_root {
                break;
            }
        }
        // Original execution order for the notification payload.
        let names: Vec<String> = popped.iter().rev().map(|e| e.name.clone()).collect();
        let keys: Vec<HistoryKey> = popped.iter().rev().map(|e| e.history_key).collect();
        if let Some(root) = popped.pop() {
            if root.level == 0 {
                self.redo_stack.push(root);
            }
        }
        self.notify_changed(&names, &keys);
        true
    }

    /// Replay the most recently undone unit using its original instance.
    ///
    /// Returns false on an empty redo stack.
    pub fn redo(&mut self) -> bool {
        let Some(entry) = self.redo_stack.pop() else {
            tracing::warn!("redo: stack is empty");
            return false;
        };
        let kwargs = match self.history.get(entry.history_key) {
            Some(recorded) => recorded.kwargs.clone(),
            None => {
                tracing::warn!(
                    command = %entry.name,
                    "redo: history entry evicted; replaying with empty kwargs"
                );
                Kwargs::new()
            }
        };
        match self.replay(entry.command.clone(), &entry.name, kwargs, ReplayMode::Redo) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(command = %entry.name, error = %err, "redo failed");
                false
            }
        }
    }

    /// Re-execute the most recent root-level command as a fresh instance.
    ///
    /// The original stays untouched on the undo stack; the replay builds a
    /// new instance from the recorded kwargs (groups get the captured
    /// member list transplanted, since a new group has none of its own).
    pub fn repeat(&mut self) -> bool {
        let Some(idx) = self.undo_stack.iter().rposition(|e| e.level == 0) else {
            tracing::warn!("repeat: no root entry on the undo stack");
            return false;
        };
        let name = self.undo_stack[idx].name.clone();
        let key = self.undo_stack[idx].history_key;
        let source = self.undo_stack[idx].command.clone();
        let kwargs = match self.history.get(key) {
            Some(recorded) => recorded.kwargs.clone(),
            None => {
                tracing::warn!(
                    command = %name,
                    "repeat: history entry evicted; rebuilding with empty kwargs"
                );
                Kwargs::new()
            }
        };
        let fresh = if name == GROUP_COMMAND {
            let Ok(instance) = source.try_lock() else {
                tracing::error!("repeat: group instance unavailable");
                return false;
            };
            match instance.as_any().downcast_ref::<GroupCmd>() {
                Some(group) => AnyCmd::Undoable(Box::new(group.clone_captured())),
                None => {
                    tracing::error!("repeat: group entry holds a non-group command");
                    return false;
                }
            }
        } else {
            match self
                .registry
                .resolve(&name)
                .and_then(|def| def.build(&kwargs))
            {
                Ok(instance) => instance,
                Err(err) => {
                    tracing::error!(command = %name, error = %err, "repeat: rebuild failed");
                    return false;
                }
            }
        };
        let shared = Arc::new(Mutex::new(fresh));
        match self.replay(shared, &name, kwargs, ReplayMode::Repeat) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(command = %name, error = %err, "repeat failed");
                false
            }
        }
    }

    /// Shared replay path for redo and repeat: sets the replay flag so the
    /// inner dispatch preserves sibling redo state, and temporarily steps
    /// out of the adapter's nesting level so the replayed unit lands at
    /// the level it was originally recorded at.
    fn replay(
        &mut self,
        command: SharedCmd,
        name: &str,
        kwargs: Kwargs,
        mode: ReplayMode,
    ) -> CommandResult {
        let saved = match mode {
            ReplayMode::Redo => {
                let saved = self.redoing;
                self.redoing = true;
                saved
            }
            ReplayMode::Repeat => {
                let saved = self.repeating;
                self.repeating = true;
                saved
            }
        };
        let buffering = self.replay_notices.is_none();
        if buffering {
            self.replay_notices = Some((Vec::new(), Vec::new()));
        }
        let adjusted = self.level > 0;
        if adjusted {
            self.level -= 1;
        }
        let result = self.dispatch(command, name, kwargs);
        if adjusted {
            self.level += 1;
        }
        match mode {
            ReplayMode::Redo => self.redoing = saved,
            ReplayMode::Repeat => self.repeating = saved,
        }
        if buffering {
            let collected = self.replay_notices.take();
            if result.is_ok() {
                if let Some((mut names, mut keys)) = collected {
                    // Members complete before their root dispatch; move the
                    // root to the front so the batch reads like undo's.
                    if let Some(root) = names.pop() {
                        names.insert(0, root);
                    }
                    if let Some(root_key) = keys.pop() {
                        keys.insert(0, root_key);
                    }
                    self.notify_changed(&names, &keys);
                }
            }
        }
        result
    }

    /// Whether a unit is available to undo.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Whether a unit is available to redo.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Whether a root-level entry is available to repeat.
    #[must_use]
    pub fn can_repeat(&self) -> bool {
        self.undo_stack.iter().any(|e| e.level == 0)
    }

    // ========================================================================
    // Grouping and disabled scopes
    // ========================================================================

    /// Open a group: subsequent root executions become members of one
    /// atomic undo unit. Pairs are counted; only the outermost pair
    /// creates a group entry.
    pub fn begin_group(&mut self) {
        self.group_depth += 1;
        if self.group_depth > 1 {
            return;
        }
        let entry_level = self.level;
        let key = self.history.record(GROUP_COMMAND, Kwargs::new(), entry_level);
        if self.disabled_depth == 0 {
            if entry_level == 0 && !self.redoing && !self.repeating {
                self.redo_stack.clear();
            }
            let command: SharedCmd = Arc::new(Mutex::new(AnyCmd::Undoable(Box::new(
                GroupCmd::default(),
            ))));
            self.undo_stack.push(StackEntry {
                command: command.clone(),
                name: GROUP_COMMAND.to_string(),
                level: entry_level,
                history_key: key,
                timestamp: Instant::now(),
            });
            self.open_group = Some(OpenGroup {
                command,
                key,
                level: entry_level,
            });
        }
        self.level += 1;
    }

    /// Close a group: capture the contiguous run of member entries into
    /// the group's replay list. Unmatched calls log and no-op. Closing an
    /// empty group still notifies.
    pub fn end_group(&mut self) {
        if self.group_depth == 0 {
            tracing::error!("end_group without matching begin_group");
            return;
        }
        self.group_depth -= 1;
        if self.group_depth > 0 {
            return;
        }
        self.level = self.level.saturating_sub(1);
        let Some(open) = self.open_group.take() else {
            // Group opened inside a disabled scope; nothing was pushed.
            return;
        };
        let Some(idx) = self
            .undo_stack
            .iter()
            .rposition(|e| Arc::ptr_eq(&e.command, &open.command))
        else {
            tracing::error!("end_group: group entry missing from undo stack");
            return;
        };
        let mut captured = Vec::new();
        for entry in &self.undo_stack[idx + 1..] {
            if entry.level == open.level + 1 {
                let kwargs = self
                    .history
                    .get(entry.history_key)
                    .map(|e| e.kwargs.clone())
                    .unwrap_or_default();
                captured.push(ReplayItem {
                    command: entry.command.clone(),
                    name: entry.name.clone(),
                    kwargs,
                });
            }
        }
        if !captured.is_empty() {
            match open.command.lock() {
                Ok(mut instance) => {
                    if let Some(group) = instance.as_any_mut().downcast_mut::<GroupCmd>() {
                        group.captured = captured;
                    }
                }
                Err(_) => tracing::error!("end_group: group instance lock poisoned"),
            }
        }
        self.notify_changed(&[GROUP_COMMAND.to_string()], &[open.key]);
    }

    /// RAII equivalent of `begin_group`/`end_group`.
    pub fn group_scope(&mut self) -> GroupScope<'_> {
        self.begin_group();
        GroupScope { engine: self }
    }

    /// Enter a disabled scope: commands run and are logged but leave no
    /// undo entries. Scopes nest; re-enabled only when the outermost ends.
    pub fn begin_disabled(&mut self) {
        self.disabled_depth += 1;
    }

    /// Leave a disabled scope. Unmatched calls log and no-op; the counter
    /// never goes negative.
    pub fn end_disabled(&mut self) {
        if self.disabled_depth == 0 {
            tracing::error!("end_disabled without matching begin_disabled");
            return;
        }
        self.disabled_depth -= 1;
    }

    /// RAII equivalent of `begin_disabled`/`end_disabled`.
    pub fn disabled_scope(&mut self) -> DisabledScope<'_> {
        self.begin_disabled();
        DisabledScope { engine: self }
    }

    // ========================================================================
    // Observers and subscriptions
    // ========================================================================

    /// Register a pre/post execution observer for a command.
    ///
    /// The name is resolved through the registry; failures are logged and
    /// return `None`.
    pub fn register_callback<F>(
        &mut self,
        name: &str,
        phase: CallbackPhase,
        observer: F,
    ) -> Option<CallbackToken>
    where
        F: FnMut(&CallbackInfo) + Send + 'static,
    {
        match self.registry.resolve(name) {
            Ok(def) => Some(self.callbacks.register(&def.qualified_name(), phase, observer)),
            Err(err) => {
                tracing::error!(command = name, error = %err, "register_callback failed");
                None
            }
        }
    }

    /// Remove one observer registration.
    pub fn unregister_callback(&mut self, token: CallbackToken) -> bool {
        self.callbacks.unregister(token)
    }

    /// Subscribe to undo-stack changes (command-name form).
    pub fn subscribe_on_change<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&[String]) + Send + 'static,
    {
        let id = SubscriptionId::change(self.next_sub);
        self.next_sub += 1;
        self.change_subs.push((id, Box::new(observer)));
        id
    }

    /// Subscribe to undo-stack changes (history-entry form).
    pub fn subscribe_on_change_detailed<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&[HistoryEntry]) + Send + 'static,
    {
        let id = SubscriptionId::detailed(self.next_sub);
        self.next_sub += 1;
        self.detailed_subs.push((id, Box::new(observer)));
        id
    }

    /// Remove a change or registry subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match id.kind {
            SubscriptionKind::Registry => self.registry.unsubscribe(id),
            SubscriptionKind::Change => {
                let before = self.change_subs.len();
                self.change_subs.retain(|(sub, _)| *sub != id);
                before != self.change_subs.len()
            }
            SubscriptionKind::ChangeDetailed => {
                let before = self.detailed_subs.len();
                self.detailed_subs.retain(|(sub, _)| *sub != id);
                before != self.detailed_subs.len()
            }
        }
    }

    fn notify_changed(&mut self, names: &[String], keys: &[HistoryKey]) {
        if self.change_subs.is_empty() && self.detailed_subs.is_empty() {
            return;
        }
        let entries: Vec<HistoryEntry> = keys
            .iter()
            .filter_map(|key| self.history.get(*key).cloned())
            .collect();
        for (_, observer) in &mut self.change_subs {
            observer(names);
        }
        for (_, observer) in &mut self.detailed_subs {
            observer(&entries);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Undo stack depth (entries, not units).
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Redo stack depth.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Names on the undo stack, most recent first.
    #[must_use]
    pub fn undo_stack_names(&self, limit: usize) -> Vec<&str> {
        self.undo_stack
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Name of the entry the next `undo` starts with.
    #[must_use]
    pub fn next_undo_name(&self) -> Option<&str> {
        self.undo_stack.last().map(|e| e.name.as_str())
    }

    /// Name of the unit the next `redo` replays.
    #[must_use]
    pub fn next_redo_name(&self) -> Option<&str> {
        self.redo_stack.last().map(|e| e.name.as_str())
    }

    /// When the entry the next `undo` starts with was executed.
    #[must_use]
    pub fn next_undo_timestamp(&self) -> Option<Instant> {
        self.undo_stack.last().map(|e| e.timestamp)
    }

    /// Current dispatch nesting level; 0 when idle.
    #[must_use]
    pub fn nesting_level(&self) -> usize {
        self.level
    }

    /// Drop both stacks without touching the invocation log.
    pub fn clear_stacks(&mut self) {
        if self.open_group.is_some() {
            tracing::warn!("clear_stacks while a group is open; the group entry is dropped");
            self.open_group = None;
        }
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    // ========================================================================
    // History surface
    // ========================================================================

    /// Retained invocation records, oldest first.
    pub fn history(&self) -> impl Iterator<Item = (HistoryKey, &HistoryEntry)> {
        self.history.entries()
    }

    /// Point lookup of one invocation record.
    #[must_use]
    pub fn history_item(&self, key: HistoryKey) -> Option<&HistoryEntry> {
        self.history.get(key)
    }

    /// Drop all invocation records.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Install the crash-diagnostics mirror sink.
    pub fn set_diagnostics_sink(&mut self, sink: Box<dyn DiagnosticsSink>) {
        self.history.set_sink(sink);
    }
}

#[derive(Clone, Copy)]
enum ReplayMode {
    Redo,
    Repeat,
}

/// Closes the group when dropped.
pub struct GroupScope<'a> {
    engine: &'a mut Engine,
}

impl Drop for GroupScope<'_> {
    fn drop(&mut self) {
        self.engine.end_group();
    }
}

impl std::ops::Deref for GroupScope<'_> {
    type Target = Engine;
    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl std::ops::DerefMut for GroupScope<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}

/// Re-enables undo tracking when dropped.
pub struct DisabledScope<'a> {
    engine: &'a mut Engine,
}

impl Drop for DisabledScope<'_> {
    fn drop(&mut self) {
        self.engine.end_disabled();
    }
}

impl std::ops::Deref for DisabledScope<'_> {
    type Target = Engine;
    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl std::ops::DerefMut for DisabledScope<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Target = Arc<Mutex<Vec<i64>>>;

    struct PushCmd {
        target: Target,
        value: i64,
    }

    impl Cmd for PushCmd {
        fn apply(&mut self, _host: &mut Engine) -> CommandResult {
            self.target.lock().unwrap().push(self.value);
            Ok(Some(ArgValue::Int(self.value)))
        }
        fn debug_name(&self) -> &'static str {
            "PushCmd"
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl UndoableCmd for PushCmd {
        fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
            self.target.lock().unwrap().pop();
            Ok(())
        }
    }

    fn push_def(target: &Target) -> CommandDef {
        let target = target.clone();
        CommandDef::new("test", "PushCommand", move |kwargs| {
            let value = kwargs
                .get("value")
                .and_then(ArgValue::as_int)
                .ok_or_else(|| CommandError::MissingArgument {
                    command: "test.Push".to_string(),
                    argument: "value".to_string(),
                })?;
            Ok(AnyCmd::Undoable(Box::new(PushCmd {
                target: target.clone(),
                value,
            })))
        })
    }

    fn engine_with_push() -> (Engine, Target) {
        let target: Target = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::default();
        engine.register(push_def(&target));
        (engine, target)
    }

    fn push(engine: &mut Engine, value: i64) {
        let (ok, _) = engine.execute("Push", Kwargs::new().with("value", value));
        assert!(ok);
    }

    #[test]
    fn test_execute_returns_command_value() {
        let (mut engine, target) = engine_with_push();
        let (ok, result) = engine.execute("Push", Kwargs::new().with("value", 7));
        assert!(ok);
        assert_eq!(result.unwrap().as_int(), Some(7));
        assert_eq!(*target.lock().unwrap(), [7]);
    }

    #[test]
    fn test_execute_unknown_name_fails_quietly() {
        let mut engine = Engine::default();
        let (ok, result) = engine.execute("Missing", Kwargs::new());
        assert!(!ok);
        assert!(result.is_none());
    }

    #[test]
    fn test_level_returns_to_zero_after_failure() {
        let mut engine = Engine::default();
        engine.register(CommandDef::new("test", "Fail", |_| {
            Err(CommandError::execution("test.Fail", "construction refused"))
        }));
        let (ok, _) = engine.execute("Fail", Kwargs::new());
        assert!(!ok);
        assert_eq!(engine.nesting_level(), 0);
    }

    #[test]
    fn test_disabled_scope_skips_stack_but_logs() {
        let (mut engine, target) = engine_with_push();
        engine.begin_disabled();
        engine.begin_disabled();
        push(&mut engine, 1);
        engine.end_disabled();
        // Still disabled: outermost scope has not ended.
        push(&mut engine, 2);
        engine.end_disabled();

        assert_eq!(*target.lock().unwrap(), [1, 2]);
        assert!(!engine.can_undo());
        assert_eq!(engine.history().count(), 2);

        // Balanced again: executions are tracked.
        push(&mut engine, 3);
        assert!(engine.can_undo());
    }

    #[test]
    fn test_end_disabled_unbalanced_is_noop() {
        let (mut engine, _target) = engine_with_push();
        engine.end_disabled();
        push(&mut engine, 1);
        assert!(engine.can_undo(), "counter must not go negative");
    }

    #[test]
    fn test_undo_adapter_runs_through_execute() {
        let (mut engine, target) = engine_with_push();
        push(&mut engine, 1);

        let (ok, result) = engine.execute("Undo", Kwargs::new());
        assert!(ok);
        assert_eq!(result.unwrap().as_bool(), Some(true));
        assert!(target.lock().unwrap().is_empty());

        // Empty stack: the adapter itself succeeds, the undo reports false.
        let (ok, result) = engine.execute("rewind.Undo", Kwargs::new());
        assert!(ok);
        assert_eq!(result.unwrap().as_bool(), Some(false));
    }

    #[test]
    fn test_redo_adapter_preserves_redo_stack_of_siblings() {
        let (mut engine, target) = engine_with_push();
        push(&mut engine, 1);
        push(&mut engine, 2);
        assert!(engine.undo());
        assert!(engine.undo());
        assert_eq!(engine.redo_depth(), 2);

        // Redo through the adapter: replays 1 without wiping 2's entry.
        let (ok, result) = engine.execute("Redo", Kwargs::new());
        assert!(ok);
        assert_eq!(result.unwrap().as_bool(), Some(true));
        assert_eq!(*target.lock().unwrap(), [1]);
        assert_eq!(engine.redo_depth(), 1);
    }

    #[test]
    fn test_repeat_uses_fresh_instance() {
        let (mut engine, target) = engine_with_push();
        push(&mut engine, 5);
        assert!(engine.repeat());
        assert_eq!(*target.lock().unwrap(), [5, 5]);
        // Two independent entries: two undos, each removing one element.
        assert!(engine.undo());
        assert_eq!(*target.lock().unwrap(), [5]);
        assert!(engine.undo());
        assert!(target.lock().unwrap().is_empty());
    }

    #[test]
    fn test_repeat_skips_nested_entries() {
        let (mut engine, target) = engine_with_push();
        push(&mut engine, 1);
        engine.begin_group();
        push(&mut engine, 2);
        engine.end_group();
        // Most recent root entry is the group; repeat replays it whole.
        assert!(engine.repeat());
        assert_eq!(*target.lock().unwrap(), [1, 2, 2]);
    }

    #[test]
    fn test_group_scope_raii() {
        let (mut engine, target) = engine_with_push();
        {
            let mut scope = engine.group_scope();
            push(&mut scope, 1);
            push(&mut scope, 2);
        }
        assert!(engine.undo());
        assert!(target.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_scope_raii() {
        let (mut engine, target) = engine_with_push();
        {
            let mut scope = engine.disabled_scope();
            push(&mut scope, 1);
        }
        assert_eq!(*target.lock().unwrap(), [1]);
        assert!(!engine.can_undo());
    }

    #[test]
    fn test_reentrant_group_pairs_create_one_entry() {
        let (mut engine, target) = engine_with_push();
        engine.begin_group();
        push(&mut engine, 1);
        engine.begin_group();
        push(&mut engine, 2);
        engine.end_group();
        push(&mut engine, 3);
        engine.end_group();

        assert!(engine.undo());
        assert!(target.lock().unwrap().is_empty());
        assert!(!engine.can_undo());
    }

    #[test]
    fn test_end_group_unbalanced_is_noop() {
        let (mut engine, _target) = engine_with_push();
        engine.end_group();
        push(&mut engine, 1);
        assert_eq!(engine.nesting_level(), 0);
        assert!(engine.undo());
    }

    #[test]
    fn test_empty_group_still_notifies() {
        let notified = Arc::new(AtomicUsize::new(0));
        let (mut engine, _target) = engine_with_push();
        let n = notified.clone();
        engine.subscribe_on_change(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });
        engine.begin_group();
        engine.end_group();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undo_notifies_once_per_unit() {
        let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, _target) = engine_with_push();
        let b = batches.clone();
        let id = engine.subscribe_on_change(move |names| {
            b.lock().unwrap().push(names.to_vec());
        });

        engine.begin_group();
        push(&mut engine, 1);
        push(&mut engine, 2);
        engine.end_group();
        batches.lock().unwrap().clear();

        assert!(engine.undo());
        let snapshot = batches.lock().unwrap().clone();
        assert_eq!(snapshot.len(), 1, "one combined notification per undo");
        assert_eq!(
            snapshot[0],
            [GROUP_COMMAND.to_string(), "test.Push".to_string(), "test.Push".to_string()]
        );

        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
    }

    #[test]
    fn test_redo_notifies_once_per_unit() {
        let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, _target) = engine_with_push();
        let b = batches.clone();
        engine.subscribe_on_change(move |names| {
            b.lock().unwrap().push(names.to_vec());
        });

        engine.begin_group();
        push(&mut engine, 1);
        push(&mut engine, 2);
        engine.end_group();
        batches.lock().unwrap().clear();

        assert!(engine.undo());
        let undo_batch = batches.lock().unwrap().pop().unwrap();
        batches.lock().unwrap().clear();

        assert!(engine.redo());
        let snapshot = batches.lock().unwrap().clone();
        assert_eq!(snapshot.len(), 1, "one combined notification per redo");
        assert_eq!(snapshot[0], undo_batch);
        assert_eq!(
            snapshot[0],
            [GROUP_COMMAND.to_string(), "test.Push".to_string(), "test.Push".to_string()]
        );
    }

    #[test]
    fn test_repeat_notifies_once_per_unit() {
        let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, _target) = engine_with_push();
        let b = batches.clone();
        engine.subscribe_on_change(move |names| {
            b.lock().unwrap().push(names.to_vec());
        });

        engine.begin_group();
        push(&mut engine, 1);
        push(&mut engine, 2);
        engine.end_group();
        batches.lock().unwrap().clear();

        assert!(engine.repeat());
        let snapshot = batches.lock().unwrap().clone();
        assert_eq!(snapshot.len(), 1, "one combined notification per repeat");
        assert_eq!(
            snapshot[0],
            [GROUP_COMMAND.to_string(), "test.Push".to_string(), "test.Push".to_string()]
        );
    }

    struct SelfUndoing {
        target: Target,
        value: i64,
    }

    impl Cmd for SelfUndoing {
        fn apply(&mut self, host: &mut Engine) -> CommandResult {
            self.target.lock().unwrap().push(self.value);
            host.execute("rewind.Undo", Kwargs::new());
            Ok(None)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl UndoableCmd for SelfUndoing {
        fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
            self.target.lock().unwrap().pop();
            Ok(())
        }
    }

    #[test]
    fn test_command_requesting_undo_of_itself_completes() {
        let target: Target = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::default();
        let t = target.clone();
        engine.register(CommandDef::new("test", "SelfUndo", move |kwargs| {
            let value = kwargs
                .get("value")
                .and_then(ArgValue::as_int)
                .ok_or_else(|| CommandError::MissingArgument {
                    command: "test.SelfUndo".to_string(),
                    argument: "value".to_string(),
                })?;
            Ok(AnyCmd::Undoable(Box::new(SelfUndoing {
                target: t.clone(),
                value,
            })))
        }));

        // The nested undo finds the command mid-apply, so its revert is
        // skipped, but the entry still moves to the redo stack and the
        // engine stays serviceable.
        let (ok, result) = engine.execute("SelfUndo", Kwargs::new().with("value", 1));
        assert!(ok);
        assert!(result.is_none());
        assert_eq!(*target.lock().unwrap(), [1]);
        assert!(!engine.can_undo());
        assert!(engine.can_redo());

        engine.register(push_def(&target));
        push(&mut engine, 2);
        assert!(engine.undo());
        assert_eq!(*target.lock().unwrap(), [1]);
    }

    #[test]
    fn test_detailed_subscription_sees_history_entries() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, _target) = engine_with_push();
        let s = seen.clone();
        engine.subscribe_on_change_detailed(move |entries| {
            let mut seen = s.lock().unwrap();
            for entry in entries {
                seen.push(entry.render());
            }
        });
        push(&mut engine, 9);
        assert_eq!(seen.lock().unwrap().as_slice(), ["test.Push(value=9)"]);
    }

    #[test]
    fn test_unregister_blocks_dispatch_and_reregister_restores() {
        let (mut engine, target) = engine_with_push();
        assert!(engine.unregister("Push"));
        let (ok, result) = engine.execute("Push", Kwargs::new().with("value", 1));
        assert!(!ok);
        assert!(result.is_none());

        engine.register(push_def(&target));
        push(&mut engine, 1);
        assert_eq!(*target.lock().unwrap(), [1]);
    }

    #[test]
    fn test_callbacks_fire_around_apply() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (mut engine, _target) = engine_with_push();

        let o = order.clone();
        engine
            .register_callback("Push", CallbackPhase::Pre, move |info| {
                assert_eq!(info.kwargs.get("value").unwrap().as_int(), Some(3));
                o.lock().unwrap().push("pre");
            })
            .unwrap();
        let o = order.clone();
        let token = engine
            .register_callback("Push", CallbackPhase::Post, move |_| {
                o.lock().unwrap().push("post");
            })
            .unwrap();

        push(&mut engine, 3);
        assert_eq!(*order.lock().unwrap(), ["pre", "post"]);

        assert!(engine.unregister_callback(token));
        push(&mut engine, 3);
        assert_eq!(*order.lock().unwrap(), ["pre", "post", "pre"]);
    }

    #[test]
    fn test_register_callback_unknown_command() {
        let mut engine = Engine::default();
        assert!(engine
            .register_callback("Missing", CallbackPhase::Pre, |_| {})
            .is_none());
    }

    #[test]
    fn test_execute_argv_with_schema() {
        let target: Target = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::default();
        engine.register(
            push_def(&target).with_schema(crate::KwargSchema::new().required("value")),
        );

        let (ok, _) = engine.execute_argv("Push", &["41".to_string()]);
        assert!(ok);
        assert_eq!(*target.lock().unwrap(), [41]);

        // Arity mismatch is a failure, not an empty-kwargs execution.
        let (ok, _) = engine.execute_argv("Push", &[]);
        assert!(!ok);
        assert_eq!(*target.lock().unwrap(), [41]);
    }

    #[test]
    fn test_clear_stacks_keeps_history() {
        let (mut engine, _target) = engine_with_push();
        push(&mut engine, 1);
        assert!(engine.undo());
        push(&mut engine, 2);
        let history_len = engine.history().count();

        engine.clear_stacks();
        assert!(!engine.can_undo());
        assert!(!engine.can_redo());
        assert_eq!(engine.history().count(), history_len);
    }

    #[test]
    fn test_stack_introspection() {
        let (mut engine, _target) = engine_with_push();
        push(&mut engine, 1);
        push(&mut engine, 2);

        assert_eq!(engine.undo_depth(), 2);
        assert_eq!(engine.undo_stack_names(10), ["test.Push", "test.Push"]);
        assert_eq!(engine.next_undo_name(), Some("test.Push"));
        assert!(engine.next_undo_timestamp().is_some());
        assert_eq!(engine.next_redo_name(), None);

        assert!(engine.undo());
        assert_eq!(engine.next_redo_name(), Some("test.Push"));
    }

    #[test]
    fn test_failed_entry_marked_in_history() {
        let mut engine = Engine::default();
        engine.register(CommandDef::new("test", "Boom", |_| {
            Ok(AnyCmd::Undoable(Box::new(BoomCmd)))
        }));
        let (ok, _) = engine.execute("Boom", Kwargs::new());
        assert!(!ok);
        let (_, entry) = engine.history().last().unwrap();
        assert!(entry.error);
    }

    struct BoomCmd;

    impl Cmd for BoomCmd {
        fn apply(&mut self, _host: &mut Engine) -> CommandResult {
            Err(CommandError::execution("test.Boom", "boom"))
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl UndoableCmd for BoomCmd {
        fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
            Ok(())
        }
    }
}
