#![forbid(unsafe_code)]

//! Command capability traits and registration metadata.
//!
//! A command is a named, parameterized unit of work. Reversibility is a
//! static capability, not a runtime probe: types implement [`Cmd`] alone to
//! be *immediate* (executed and logged, never on the undo stack) or
//! [`UndoableCmd`] to be *transactional* (pushed on the undo stack when
//! executed outside a disabled scope). [`AnyCmd`] is the engine's uniform
//! instance type; dispatch branches on its variant.
//!
//! [`CommandDef`] is what actually lives in the registry: the factory that
//! builds an [`AnyCmd`] from keyword arguments, plus an optional
//! [`KwargSchema`] for argv synthesis and bridge binding.
//!
//! # Invariants
//!
//! - `apply()` followed by `revert()` restores prior state exactly.
//! - A factory must not mutate engine state; construction is side-effect
//!   free, only `apply` runs the operation.
//! - `callback_info` returns a fresh map; observers never see (or mutate)
//!   the kwargs the command was built from.

use std::any::Any;
use std::fmt;

use crate::engine::Engine;
use crate::error::{CommandError, CommandResult};
use crate::value::{ArgValue, Kwargs};

/// Observer phase relative to a command's `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackPhase {
    /// Fired before `apply`, after the undo entry is pushed.
    Pre,
    /// Fired after `apply` returned successfully.
    Post,
}

/// An executable command.
///
/// Commands receive the engine itself so they can dispatch nested
/// sub-commands through the same machinery (nested executions land at
/// level + 1 and unwind with their parent on failure).
pub trait Cmd: Send {
    /// Run the operation. An `Err` triggers transactional unwinding in the
    /// engine; the optional value is surfaced to the `execute` caller.
    fn apply(&mut self, host: &mut Engine) -> CommandResult;

    /// Derive the argument map observers see for the given phase.
    ///
    /// The default hands observers an unmodified snapshot.
    fn callback_info(&self, _phase: CallbackPhase, kwargs: &Kwargs) -> Kwargs {
        kwargs.clone()
    }

    /// Short name for Debug output.
    fn debug_name(&self) -> &'static str {
        "Cmd"
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A reversible command.
pub trait UndoableCmd: Cmd {
    /// Reverse the effect of a prior successful `apply`.
    fn revert(&mut self, host: &mut Engine) -> Result<(), CommandError>;
}

/// A command instance with its capability made explicit.
pub enum AnyCmd {
    /// Runs and is logged, but never lands on the undo stack.
    Immediate(Box<dyn Cmd>),
    /// Runs and is pushed on the undo stack (outside disabled scopes).
    Undoable(Box<dyn UndoableCmd>),
}

impl AnyCmd {
    /// Whether this instance can be reverted.
    #[must_use]
    pub fn is_undoable(&self) -> bool {
        matches!(self, Self::Undoable(_))
    }

    /// Run the command.
    pub fn apply(&mut self, host: &mut Engine) -> CommandResult {
        match self {
            Self::Immediate(cmd) => cmd.apply(host),
            Self::Undoable(cmd) => cmd.apply(host),
        }
    }

    /// Reverse the command. Fails for immediate commands.
    pub fn revert(&mut self, host: &mut Engine) -> Result<(), CommandError> {
        match self {
            Self::Immediate(cmd) => Err(CommandError::Internal(format!(
                "'{}' has no revert",
                cmd.debug_name()
            ))),
            Self::Undoable(cmd) => cmd.revert(host),
        }
    }

    /// Derive the observer argument map for a phase.
    #[must_use]
    pub fn callback_info(&self, phase: CallbackPhase, kwargs: &Kwargs) -> Kwargs {
        match self {
            Self::Immediate(cmd) => cmd.callback_info(phase, kwargs),
            Self::Undoable(cmd) => cmd.callback_info(phase, kwargs),
        }
    }

    /// Downcast to a concrete command type.
    #[must_use]
    pub fn as_any(&self) -> &dyn Any {
        match self {
            Self::Immediate(cmd) => cmd.as_any(),
            Self::Undoable(cmd) => cmd.as_any(),
        }
    }

    /// Mutable downcast to a concrete command type.
    #[must_use]
    pub fn as_any_mut(&mut self) -> &mut dyn Any {
        match self {
            Self::Immediate(cmd) => cmd.as_any_mut(),
            Self::Undoable(cmd) => cmd.as_any_mut(),
        }
    }

    fn debug_name(&self) -> &'static str {
        match self {
            Self::Immediate(cmd) => cmd.debug_name(),
            Self::Undoable(cmd) => cmd.debug_name(),
        }
    }
}

impl fmt::Debug for AnyCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.debug_name())
            .field("undoable", &self.is_undoable())
            .finish()
    }
}

/// Declared keyword arguments of a command: required names, optional names,
/// and default values. Used to synthesize kwargs from positional argv and
/// to validate arguments crossing the bridge.
#[derive(Debug, Clone, Default)]
pub struct KwargSchema {
    required: Vec<String>,
    optional: Vec<String>,
    defaults: Kwargs,
}

impl KwargSchema {
    /// Create an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required argument.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Declare an optional argument with no default.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.optional.push(name.into());
        self
    }

    /// Declare an optional argument with a default value.
    #[must_use]
    pub fn default_value(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        let name = name.into();
        self.defaults.insert(name.clone(), value);
        self.optional.push(name);
        self
    }

    /// Required argument names, in declaration order.
    #[must_use]
    pub fn required_names(&self) -> &[String] {
        &self.required
    }

    /// Positional order for argv synthesis: required first, then optional.
    pub fn positional_order(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
    }

    fn declares(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name) || self.optional.iter().any(|o| o == name)
    }

    /// Validate and complete a caller-supplied argument map.
    ///
    /// Missing required arguments are an error. Unexpected arguments are
    /// warned about but passed through. Declared optionals fall back to
    /// their defaults.
    pub fn bind(&self, command: &str, kwargs: &Kwargs) -> Result<Kwargs, CommandError> {
        let mut bound = Kwargs::new();
        for name in &self.required {
            match kwargs.get(name) {
                Some(value) => bound.insert(name.clone(), value.clone()),
                None => {
                    return Err(CommandError::MissingArgument {
                        command: command.to_string(),
                        argument: name.clone(),
                    });
                }
            }
        }
        for name in &self.optional {
            if let Some(value) = kwargs.get(name) {
                bound.insert(name.clone(), value.clone());
            } else if let Some(default) = self.defaults.get(name) {
                bound.insert(name.clone(), default.clone());
            }
        }
        for (key, value) in kwargs.iter() {
            if !self.declares(key) {
                tracing::warn!(command, argument = key, "unexpected keyword argument");
                bound.insert(key.to_string(), value.clone());
            }
        }
        Ok(bound)
    }

    /// Synthesize a keyword map from a positional argument vector.
    pub fn kwargs_from_argv(&self, command: &str, argv: &[String]) -> Result<Kwargs, CommandError> {
        let declared = self.required.len() + self.optional.len();
        if argv.len() > declared {
            return Err(CommandError::ArgvParse {
                command: command.to_string(),
                message: format!("{} arguments supplied, at most {declared} declared", argv.len()),
            });
        }
        if argv.len() < self.required.len() {
            return Err(CommandError::ArgvParse {
                command: command.to_string(),
                message: format!(
                    "{} arguments supplied, {} required",
                    argv.len(),
                    self.required.len()
                ),
            });
        }
        let mut kwargs = Kwargs::new();
        for (name, token) in self.positional_order().zip(argv.iter()) {
            kwargs.insert(name.to_string(), ArgValue::parse_token(token));
        }
        Ok(kwargs)
    }
}

/// Factory signature: build a command instance from keyword arguments.
pub type CmdFactory = dyn Fn(&Kwargs) -> Result<AnyCmd, CommandError> + Send + Sync;
/// Custom argv parser hook, overrides schema-based synthesis.
pub type ArgvParser = dyn Fn(&[String]) -> Result<Kwargs, CommandError> + Send + Sync;

/// A registered command: identity, factory, and argument metadata.
pub struct CommandDef {
    module: String,
    name: String,
    factory: Box<CmdFactory>,
    schema: Option<KwargSchema>,
    argv_parser: Option<Box<ArgvParser>>,
    immediate: bool,
}

impl CommandDef {
    /// Create a definition. `module` may be empty for unqualified commands;
    /// a trailing `"Command"` in `name` is stripped at registration.
    pub fn new<F>(module: impl Into<String>, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Kwargs) -> Result<AnyCmd, CommandError> + Send + Sync + 'static,
    {
        Self {
            module: module.into(),
            name: name.into(),
            factory: Box::new(factory),
            schema: None,
            argv_parser: None,
            immediate: false,
        }
    }

    /// Attach a keyword-argument schema.
    #[must_use]
    pub fn with_schema(mut self, schema: KwargSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Attach a custom argv parser hook.
    #[must_use]
    pub fn with_argv_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&[String]) -> Result<Kwargs, CommandError> + Send + Sync + 'static,
    {
        self.argv_parser = Some(Box::new(parser));
        self
    }

    /// Expose this command through the module accessor's `immediate`
    /// sub-namespace (executed inside a disabled scope).
    #[must_use]
    pub fn with_immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// The registering module.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Replace the registering module (batch registration re-homes
    /// definitions under the batch's module id).
    #[must_use]
    pub fn rehome(mut self, module: &str) -> Self {
        self.module = module.to_string();
        self
    }

    /// Registered name as supplied (suffix not yet stripped).
    #[must_use]
    pub fn raw_name(&self) -> &str {
        &self.name
    }

    /// Canonical short name: trailing `"Command"` stripped, unless the name
    /// is exactly `"Command"`.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        match self.name.strip_suffix("Command") {
            Some(short) if !short.is_empty() => short,
            _ => &self.name,
        }
    }

    /// `module.Name`, or just the canonical name for an empty module.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.canonical_name().to_string()
        } else {
            format!("{}.{}", self.module, self.canonical_name())
        }
    }

    /// The declared argument schema, if any.
    #[must_use]
    pub fn schema(&self) -> Option<&KwargSchema> {
        self.schema.as_ref()
    }

    /// Whether the module accessor exposes an immediate entry point.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// Build an instance from keyword arguments.
    pub fn build(&self, kwargs: &Kwargs) -> Result<AnyCmd, CommandError> {
        (self.factory)(kwargs)
    }

    /// Build kwargs from positional argv via the parser hook or the schema.
    pub fn parse_argv(&self, argv: &[String]) -> Result<Kwargs, CommandError> {
        if let Some(parser) = &self.argv_parser {
            return parser(argv);
        }
        match &self.schema {
            Some(schema) => schema.kwargs_from_argv(&self.qualified_name(), argv),
            None => Err(CommandError::ArgvParse {
                command: self.qualified_name(),
                message: "no argv parser or argument schema declared".to_string(),
            }),
        }
    }
}

impl fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDef")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("has_schema", &self.schema.is_some())
            .field("has_argv_parser", &self.argv_parser.is_some())
            .field("immediate", &self.immediate)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Cmd for Noop {
        fn apply(&mut self, _host: &mut Engine) -> CommandResult {
            Ok(None)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn noop_def(module: &str, name: &str) -> CommandDef {
        CommandDef::new(module, name, |_| Ok(AnyCmd::Immediate(Box::new(Noop))))
    }

    #[test]
    fn test_canonical_name_strips_suffix() {
        assert_eq!(noop_def("scene", "AppendCommand").canonical_name(), "Append");
        assert_eq!(noop_def("scene", "Append").canonical_name(), "Append");
        // A name that is exactly the suffix is kept as-is.
        assert_eq!(noop_def("scene", "Command").canonical_name(), "Command");
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(noop_def("scene", "AppendCommand").qualified_name(), "scene.Append");
        assert_eq!(noop_def("", "Append").qualified_name(), "Append");
    }

    #[test]
    fn test_schema_bind_defaults_and_missing() {
        let schema = KwargSchema::new()
            .required("x")
            .default_value("y", 7)
            .optional("z");

        let bound = schema
            .bind("scene.Append", &Kwargs::new().with("x", 1))
            .unwrap();
        assert_eq!(bound.get("x").unwrap().as_int(), Some(1));
        assert_eq!(bound.get("y").unwrap().as_int(), Some(7));
        assert!(bound.get("z").is_none());

        let err = schema.bind("scene.Append", &Kwargs::new()).unwrap_err();
        assert!(matches!(err, CommandError::MissingArgument { argument, .. } if argument == "x"));
    }

    #[test]
    fn test_schema_bind_passes_unexpected_through() {
        let schema = KwargSchema::new().required("x");
        let bound = schema
            .bind("scene.Append", &Kwargs::new().with("x", 1).with("extra", 2))
            .unwrap();
        assert_eq!(bound.get("extra").unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_kwargs_from_argv() {
        let schema = KwargSchema::new().required("x").required("y").optional("tag");
        let kwargs = schema
            .kwargs_from_argv("scene.Append", &["1".into(), "2.5".into(), "head".into()])
            .unwrap();
        assert_eq!(kwargs.get("x").unwrap().as_int(), Some(1));
        assert_eq!(kwargs.get("y").unwrap().as_float(), Some(2.5));
        assert_eq!(kwargs.get("tag").unwrap().as_str(), Some("head"));
    }

    #[test]
    fn test_kwargs_from_argv_arity_errors() {
        let schema = KwargSchema::new().required("x").required("y");
        assert!(matches!(
            schema.kwargs_from_argv("c", &["1".into()]),
            Err(CommandError::ArgvParse { .. })
        ));
        assert!(matches!(
            schema.kwargs_from_argv("c", &["1".into(), "2".into(), "3".into()]),
            Err(CommandError::ArgvParse { .. })
        ));
    }

    #[test]
    fn test_parse_argv_prefers_hook() {
        let def = noop_def("scene", "Append")
            .with_schema(KwargSchema::new().required("x"))
            .with_argv_parser(|argv| {
                Ok(Kwargs::new().with("joined", argv.join("+")))
            });
        let kwargs = def.parse_argv(&["a".into(), "b".into()]).unwrap();
        assert_eq!(kwargs.get("joined").unwrap().as_str(), Some("a+b"));
    }

    #[test]
    fn test_parse_argv_without_schema_fails() {
        let def = noop_def("scene", "Append");
        assert!(matches!(
            def.parse_argv(&[]),
            Err(CommandError::ArgvParse { .. })
        ));
    }
}
