#![forbid(unsafe_code)]

//! Rewind
//!
//! A transactional command engine: named, parameterized commands are
//! registered once, executed by name with keyword arguments, logged, and —
//! when they know how to reverse themselves — undone, redone, and repeated
//! as atomic units.
//!
//! # Key Components
//!
//! - [`Engine`] - The state machine: dispatch, stacks, groups, scopes
//! - [`Cmd`] / [`UndoableCmd`] - Traits command implementations provide
//! - [`CommandDef`] - A registered factory with name, module, and schema
//! - [`Kwargs`] / [`ArgValue`] - Insertion-ordered keyword arguments
//! - [`HistoryLog`] - Bounded append-only record of every invocation
//! - [`CallbackRegistry`] - Pre/post execution observers per command
//! - [`CommandBridge`] / [`ForeignHandle`] - Foreign-implementation adapter
//!
//! # Example
//!
//! ```
//! use rewind::{AnyCmd, ArgValue, Cmd, CommandDef, CommandError, CommandResult,
//!              Engine, Kwargs, UndoableCmd};
//! use std::sync::{Arc, Mutex};
//!
//! struct AppendCmd {
//!     target: Arc<Mutex<Vec<i64>>>,
//!     value: i64,
//! }
//!
//! impl Cmd for AppendCmd {
//!     fn apply(&mut self, _host: &mut Engine) -> CommandResult {
//!         self.target.lock().unwrap().push(self.value);
//!         Ok(None)
//!     }
//!     fn as_any(&self) -> &dyn std::any::Any { self }
//!     fn as_any_mut(&mut self) -> &mut dyn std::any::Any { self }
//! }
//!
//! impl UndoableCmd for AppendCmd {
//!     fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
//!         self.target.lock().unwrap().pop();
//!         Ok(())
//!     }
//! }
//!
//! let target: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
//! let mut engine = Engine::default();
//! let factory_target = target.clone();
//! engine.register(CommandDef::new("demo", "Append", move |kwargs| {
//!     let value = kwargs.get("value").and_then(ArgValue::as_int).unwrap_or(0);
//!     Ok(AnyCmd::Undoable(Box::new(AppendCmd {
//!         target: factory_target.clone(),
//!         value,
//!     })))
//! }));
//!
//! engine.execute("Append", Kwargs::new().with("value", 3));
//! assert_eq!(*target.lock().unwrap(), [3]);
//! engine.undo();
//! assert!(target.lock().unwrap().is_empty());
//! engine.redo();
//! assert_eq!(*target.lock().unwrap(), [3]);
//! ```

pub mod bridge;
pub mod callback;
pub mod command;
pub mod engine;
pub mod error;
pub mod history;
pub mod registry;
pub mod value;

pub use bridge::{foreign_command_def, BridgeCommand, CommandBridge, ForeignHandle};
pub use callback::{CallbackInfo, CallbackRegistry, CallbackToken};
pub use command::{AnyCmd, CallbackPhase, Cmd, CommandDef, KwargSchema, UndoableCmd};
pub use engine::{
    DisabledScope, Engine, EngineConfig, GroupScope, SubscriptionId, BUILTIN_MODULE, GROUP_COMMAND,
};
pub use error::{CommandError, CommandResult};
pub use history::{DiagnosticsSink, HistoryConfig, HistoryEntry, HistoryKey, HistoryLog};
pub use registry::{register_module, CommandRegistry, ModuleCommands};
pub use value::{ArgValue, Kwargs};
