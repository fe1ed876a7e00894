//! Call frames and namespaces.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{EngineError, EngineResult, VariableError};
use crate::flags::CallFrameFlags;
use crate::variable::Variable;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// One activation record on an interpreter's call stack.
#[derive(Debug)]
pub struct CallFrame {
    id: u64,
    name: String,
    flags: CallFrameFlags,
    /// `None` for frames created with `NO_VARIABLES`
    variables: Option<RwLock<IndexMap<String, Arc<Variable>>>>,
}

impl CallFrame {
    pub fn new(name: impl Into<String>, flags: CallFrameFlags) -> Self {
        let variables = if flags.contains(CallFrameFlags::NO_VARIABLES) {
            None
        } else {
            Some(RwLock::new(IndexMap::new()))
        };
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            flags,
            variables,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> CallFrameFlags {
        self.flags
    }

    pub fn is_global(&self) -> bool {
        self.flags.contains(CallFrameFlags::GLOBAL)
    }

    pub fn is_scope(&self) -> bool {
        self.flags.contains(CallFrameFlags::SCOPE)
    }

    pub fn has_variables(&self) -> bool {
        self.variables.is_some()
    }

    fn table(&self) -> EngineResult<&RwLock<IndexMap<String, Arc<Variable>>>> {
        self.variables
            .as_ref()
            .ok_or_else(|| EngineError::call_frame("call frame does not support variables"))
    }

    /// Declare a variable in this frame.
    pub fn add_variable(&self, variable: Arc<Variable>) -> EngineResult<()> {
        let mut table = self.table()?.write();
        if table.contains_key(variable.name()) {
            return Err(VariableError::AlreadyExists {
                name: variable.name().to_string(),
            }
            .into());
        }
        table.insert(variable.name().to_string(), variable);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Variable>> {
        self.variables.as_ref()?.read().get(name).cloned()
    }

    pub fn remove_variable(&self, name: &str) -> Option<Arc<Variable>> {
        self.variables.as_ref()?.write().shift_remove(name)
    }

    /// Snapshot of the declared variables.
    pub fn variables(&self) -> EngineResult<Vec<Arc<Variable>>> {
        Ok(self.table()?.read().values().cloned().collect())
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables
            .as_ref()
            .map(|t| t.read().keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// A named namespace. The global namespace has no variable frame of its own.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    frame: Option<Arc<CallFrame>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, frame: Option<Arc<CallFrame>>) -> Self {
        Self {
            name: name.into(),
            frame,
        }
    }

    /// Fully qualified name, e.g. `::util`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variable_frame(&self) -> Option<&Arc<CallFrame>> {
        self.frame.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::VariableFlags;
    use crate::variable::FrameStorage;

    fn variable(name: &str) -> Arc<Variable> {
        Arc::new(Variable::new(
            name,
            VariableFlags::empty(),
            Arc::new(FrameStorage::new()),
        ))
    }

    #[test]
    fn test_frame_variables() {
        let frame = CallFrame::new("proc", CallFrameFlags::PROCEDURE);
        frame.add_variable(variable("a")).unwrap();
        frame.add_variable(variable("b")).unwrap();
        assert!(matches!(
            frame.add_variable(variable("a")),
            Err(EngineError::Variable(VariableError::AlreadyExists { .. }))
        ));
        assert_eq!(frame.variable_names(), vec!["a", "b"]);
        assert!(frame.remove_variable("a").is_some());
        assert!(frame.lookup("a").is_none());
    }

    #[test]
    fn test_frame_without_variables() {
        let frame = CallFrame::new("track", CallFrameFlags::TRACKING | CallFrameFlags::NO_VARIABLES);
        assert!(!frame.has_variables());
        let err = frame.variables().unwrap_err();
        assert_eq!(err.to_string(), "call frame does not support variables");
        assert!(frame.add_variable(variable("a")).is_err());
    }

    #[test]
    fn test_frame_ids_unique() {
        let a = CallFrame::new("a", CallFrameFlags::empty());
        let b = CallFrame::new("b", CallFrameFlags::empty());
        assert_ne!(a.id(), b.id());
    }
}
