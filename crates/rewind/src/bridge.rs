#![forbid(unsafe_code)]

//! Adapter for command implementations that live outside the engine.
//!
//! A foreign implementation — native plugin, scripting runtime, remote
//! host — supplies an opaque [`ForeignHandle`]. Registration synthesizes
//! one generic [`BridgeCommand`] per call (not a new type per command):
//! the handle plus a keyword-argument schema declaring required, optional,
//! and defaulted arguments. The bound argument snapshot is taken once at
//! construction and never mutated afterwards, so undo sees exactly the
//! arguments that execution saw.
//!
//! [`CommandBridge`] is the other direction: a handle the foreign side
//! keeps to drive execution, undo/redo/repeat, grouping, and disabled
//! scopes on a shared engine. Every entry point reports plain booleans;
//! errors are logged, never propagated across the boundary.
//!
//! The shared-engine mutex serializes callers; the engine itself is
//! reentrant by recursion only, so foreign calls must not re-enter the
//! bridge from inside a handle's `invoke`.

use std::sync::{Arc, Mutex};

use crate::command::{AnyCmd, Cmd, CommandDef, KwargSchema, UndoableCmd};
use crate::engine::Engine;
use crate::error::{CommandError, CommandResult};
use crate::value::{ArgValue, Kwargs};

/// The foreign side of a bridged command.
///
/// `invoke` and `revert` take `&self`: the handle is shared between the
/// undo-stack entry and any repeat-built instances, so per-call state
/// belongs in the bound kwargs, not in the handle.
pub trait ForeignHandle: Send + Sync {
    /// Forward execution with the bound arguments.
    fn invoke(&self, kwargs: &Kwargs) -> CommandResult;

    /// Reverse execution. Only called when [`ForeignHandle::undoable`]
    /// reports true.
    fn revert(&self, kwargs: &Kwargs) -> Result<(), CommandError> {
        let _ = kwargs;
        Ok(())
    }

    /// Whether this handle supports `revert`. Handles reporting false are
    /// registered as immediate commands: logged, never on the undo stack.
    fn undoable(&self) -> bool {
        true
    }
}

/// Engine-shaped wrapper around one foreign handle and one bound
/// argument snapshot.
pub struct BridgeCommand {
    handle: Arc<dyn ForeignHandle>,
    kwargs: Kwargs,
}

impl BridgeCommand {
    fn new(handle: Arc<dyn ForeignHandle>, kwargs: Kwargs) -> Self {
        Self { handle, kwargs }
    }

    /// The arguments bound at construction.
    #[must_use]
    pub fn bound_kwargs(&self) -> &Kwargs {
        &self.kwargs
    }
}

impl Cmd for BridgeCommand {
    fn apply(&mut self, _host: &mut Engine) -> CommandResult {
        self.handle.invoke(&self.kwargs)
    }

    fn debug_name(&self) -> &'static str {
        "BridgeCommand"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl UndoableCmd for BridgeCommand {
    fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
        self.handle.revert(&self.kwargs)
    }
}

/// Build a registerable definition from a foreign handle.
///
/// The factory binds incoming kwargs through `schema` — missing required
/// arguments fail construction, unexpected ones warn and pass through —
/// and wraps the handle as undoable or immediate per its own report.
#[must_use]
pub fn foreign_command_def(
    module: impl Into<String>,
    name: impl Into<String>,
    schema: KwargSchema,
    handle: Arc<dyn ForeignHandle>,
) -> CommandDef {
    let module = module.into();
    let name = name.into();
    let qualified = format!("{module}.{name}");
    let factory_schema = schema.clone();
    let def = CommandDef::new(module, name, move |kwargs| {
        let bound = factory_schema.bind(&qualified, kwargs)?;
        let command = BridgeCommand::new(handle.clone(), bound);
        if handle.undoable() {
            Ok(AnyCmd::Undoable(Box::new(command)))
        } else {
            Ok(AnyCmd::Immediate(Box::new(command)))
        }
    });
    def.with_schema(schema)
}

/// Foreign-side control surface over a shared engine.
#[derive(Clone)]
pub struct CommandBridge {
    engine: Arc<Mutex<Engine>>,
}

impl CommandBridge {
    #[must_use]
    pub fn new(engine: Arc<Mutex<Engine>>) -> Self {
        Self { engine }
    }

    /// The engine this bridge drives.
    #[must_use]
    pub fn engine(&self) -> &Arc<Mutex<Engine>> {
        &self.engine
    }

    fn with_engine<T>(&self, fallback: T, f: impl FnOnce(&mut Engine) -> T) -> T {
        match self.engine.lock() {
            Ok(mut engine) => f(&mut engine),
            Err(_) => {
                tracing::error!("bridge: engine lock poisoned");
                fallback
            }
        }
    }

    /// Register a foreign command under `module.name`.
    pub fn register_foreign(
        &self,
        module: &str,
        name: &str,
        schema: KwargSchema,
        handle: Arc<dyn ForeignHandle>,
    ) -> bool {
        let def = foreign_command_def(module, name, schema, handle);
        self.with_engine(false, |engine| engine.register(def))
    }

    /// Unregister whatever `name` resolves to, foreign or not.
    pub fn unregister(&self, name: &str) -> bool {
        self.with_engine(false, |engine| engine.unregister(name))
    }

    /// Execute any registered command by name. The foreign side only gets
    /// the success flag; result values stay engine-side.
    pub fn execute(&self, name: &str, kwargs: Kwargs) -> bool {
        self.with_engine(false, |engine| engine.execute(name, kwargs).0)
    }

    /// Execute with both the success flag and the result value.
    pub fn execute_with_result(&self, name: &str, kwargs: Kwargs) -> (bool, Option<ArgValue>) {
        self.with_engine((false, None), |engine| engine.execute(name, kwargs))
    }

    pub fn undo(&self) -> bool {
        self.with_engine(false, Engine::undo)
    }

    pub fn redo(&self) -> bool {
        self.with_engine(false, Engine::redo)
    }

    pub fn repeat(&self) -> bool {
        self.with_engine(false, Engine::repeat)
    }

    pub fn begin_group(&self) {
        self.with_engine((), Engine::begin_group);
    }

    pub fn end_group(&self) {
        self.with_engine((), Engine::end_group);
    }

    pub fn begin_disabled(&self) {
        self.with_engine((), Engine::begin_disabled);
    }

    pub fn end_disabled(&self) {
        self.with_engine((), Engine::end_disabled);
    }
}

// ============================================================================
// Tests
// ============================================================================
