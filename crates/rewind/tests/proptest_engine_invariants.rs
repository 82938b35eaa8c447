//! Model-based property tests: the engine against a simple reference
//! model of the two stacks and the observable list state.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use rewind::{
    AnyCmd, ArgValue, Cmd, CommandDef, CommandError, CommandResult, Engine, Kwargs, UndoableCmd,
};

type SharedList = Arc<Mutex<Vec<i64>>>;

struct PushCmd {
    list: SharedList,
    value: i64,
}

impl Cmd for PushCmd {
    fn apply(&mut self, _host: &mut Engine) -> CommandResult {
        self.list.lock().unwrap().push(self.value);
        Ok(None)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl UndoableCmd for PushCmd {
    fn revert(&mut self, _host: &mut Engine) -> Result<(), CommandError> {
        self.list.lock().unwrap().pop();
        Ok(())
    }
}

fn engine_with_push() -> (Engine, SharedList) {
    let list: SharedList = Arc::new(Mutex::new(Vec::new()));
    let mut engine = Engine::default();
    let factory_list = list.clone();
    engine.register(CommandDef::new("model", "Push", move |kwargs| {
        let value = kwargs
            .get("value")
            .and_then(ArgValue::as_int)
            .ok_or_else(|| CommandError::MissingArgument {
                command: "model.Push".to_string(),
                argument: "value".to_string(),
            })?;
        Ok(AnyCmd::Undoable(Box::new(PushCmd {
            list: factory_list.clone(),
            value,
        })))
    }));
    (engine, list)
}

/// Reference model: list state plus both stacks as plain value vectors.
#[derive(Default)]
struct Model {
    list: Vec<i64>,
    undo: Vec<i64>,
    redo: Vec<i64>,
}

impl Model {
    fn push(&mut self, value: i64) {
        self.list.push(value);
        self.undo.push(value);
        self.redo.clear();
    }

    fn undo(&mut self) -> bool {
        match self.undo.pop() {
            Some(value) => {
                self.list.pop();
                self.redo.push(value);
                true
            }
            None => false,
        }
    }

    fn redo(&mut self) -> bool {
        match self.redo.pop() {
            Some(value) => {
                self.list.push(value);
                self.undo.push(value);
                true
            }
            None => false,
        }
    }

    fn repeat(&mut self) -> bool {
        match self.undo.last().copied() {
            Some(value) => {
                // A repeat is a replay, so sibling redo entries survive.
                self.list.push(value);
                self.undo.push(value);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Push(i64),
    Undo,
    Redo,
    Repeat,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-100i64..=100).prop_map(Op::Push),
        Just(Op::Undo),
        Just(Op::Redo),
        Just(Op::Repeat),
    ]
}

proptest! {
    #[test]
    fn engine_matches_reference_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let (mut engine, list) = engine_with_push();
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Push(value) => {
                    let (ok, _) = engine.execute("Push", Kwargs::new().with("value", value));
                    prop_assert!(ok);
                    model.push(value);
                }
                Op::Undo => prop_assert_eq!(engine.undo(), model.undo()),
                Op::Redo => prop_assert_eq!(engine.redo(), model.redo()),
                Op::Repeat => prop_assert_eq!(engine.repeat(), model.repeat()),
            }
            prop_assert_eq!(&*list.lock().unwrap(), &model.list);
            prop_assert_eq!(engine.can_undo(), !model.undo.is_empty());
            prop_assert_eq!(engine.can_redo(), !model.redo.is_empty());
            prop_assert_eq!(engine.undo_depth(), model.undo.len());
            prop_assert_eq!(engine.redo_depth(), model.redo.len());
            prop_assert_eq!(engine.nesting_level(), 0usize);
        }
    }

    #[test]
    fn full_undo_drains_and_full_redo_restores(values in proptest::collection::vec(-100i64..=100, 1..32)) {
        let (mut engine, list) = engine_with_push();
        for &value in &values {
            let (ok, _) = engine.execute("Push", Kwargs::new().with("value", value));
            prop_assert!(ok);
        }

        for _ in 0..values.len() {
            prop_assert!(engine.undo());
        }
        prop_assert!(!engine.undo());
        prop_assert!(list.lock().unwrap().is_empty());

        for _ in 0..values.len() {
            prop_assert!(engine.redo());
        }
        prop_assert!(!engine.redo());
        prop_assert_eq!(&*list.lock().unwrap(), &values);
    }

    #[test]
    fn grouped_batches_undo_atomically(batches in proptest::collection::vec(proptest::collection::vec(-100i64..=100, 1..5), 1..8)) {
        let (mut engine, list) = engine_with_push();
        for batch in &batches {
            engine.begin_group();
            for &value in batch {
                let (ok, _) = engine.execute("Push", Kwargs::new().with("value", value));
                prop_assert!(ok);
            }
            engine.end_group();
        }
        let flat: Vec<i64> = batches.iter().flatten().copied().collect();
        prop_assert_eq!(&*list.lock().unwrap(), &flat);

        // One undo per batch, regardless of batch size.
        for _ in 0..batches.len() {
            prop_assert!(engine.undo());
        }
        prop_assert!(!engine.undo());
        prop_assert!(list.lock().unwrap().is_empty());

        for _ in 0..batches.len() {
            prop_assert!(engine.redo());
        }
        prop_assert_eq!(&*list.lock().unwrap(), &flat);
    }

    #[test]
    fn disabled_executions_never_touch_the_stacks(tracked in proptest::collection::vec(-100i64..=100, 0..8),
                                                 untracked in proptest::collection::vec(-100i64..=100, 0..8)) {
        let (mut engine, _list) = engine_with_push();
        for &value in &tracked {
            engine.execute("Push", Kwargs::new().with("value", value));
        }
        engine.begin_disabled();
        for &value in &untracked {
            engine.execute("Push", Kwargs::new().with("value", value));
        }
        engine.end_disabled();

        prop_assert_eq!(engine.undo_depth(), tracked.len());
        prop_assert_eq!(engine.history().count(), tracked.len() + untracked.len());
    }
}
