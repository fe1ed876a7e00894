//! Thread-partitioned variable storage.
//!
//! A thread variable is declared once, in any frame, but every thread sees
//! its own value: the slot is keyed by the accessing thread's id. A slot is
//! created on a thread's first write and removed when that thread is
//! cleaned up (or when the whole store is wiped). Removing one thread's slot
//! never touches another's.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{EngineResult, VariableError, VariableOp};
use crate::flags::VariableFlags;
use crate::frame::CallFrame;
use crate::interpreter::Interpreter;
use crate::text::{MatchMode, Matcher, glob_match, make_list, quote_element};
use crate::thread_id::current_thread_id;
use crate::variable::{
    Slot, Variable, VariableAccess, VariableStorage, read_slot, remove_from_slot, slot_exists,
    write_slot,
};

const FOR_THREAD: &str = " for thread";

/// Storage backend holding one slot per thread.
#[derive(Debug, Default)]
pub struct ThreadVariable {
    values: Mutex<HashMap<u64, Slot>>,
}

impl ThreadVariable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a thread variable named `name` in the interpreter.
    pub fn add_variable(
        interpreter: &Interpreter,
        flags: VariableFlags,
        name: &str,
    ) -> EngineResult<Arc<ThreadVariable>> {
        let storage = Arc::new(ThreadVariable::new());
        interpreter.add_variable(
            flags | VariableFlags::THREAD,
            name,
            Arc::clone(&storage) as Arc<dyn VariableStorage>,
        )?;
        Ok(storage)
    }

    /// Remove one thread's slot. Returns whether it existed.
    pub fn cleanup_for_thread(&self, thread_id: u64) -> bool {
        self.values.lock().remove(&thread_id).is_some()
    }

    /// Remove every thread's slot. Returns the number removed.
    pub fn cleanup_for_all(&self) -> usize {
        let mut values = self.values.lock();
        let count = values.len();
        values.clear();
        count
    }

    /// Number of threads holding a value.
    pub fn thread_count(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether the calling thread holds a value.
    pub fn does_exist(&self) -> bool {
        self.values.lock().contains_key(&current_thread_id())
    }

    /// Whether the calling thread holds an array containing `element`
    /// (any array when `element` is `None`).
    pub fn does_element_exist(&self, element: Option<&str>) -> bool {
        match self.values.lock().get(&current_thread_id()) {
            Some(Slot::Array(elements)) => element.is_none_or(|e| elements.contains_key(e)),
            _ => false,
        }
    }

    fn with_array<T>(&self, name: &str, f: impl FnOnce(&IndexMap<String, String>) -> T) -> Result<T, VariableError> {
        match self.values.lock().get(&current_thread_id()) {
            Some(Slot::Array(elements)) => Ok(f(elements)),
            Some(Slot::Scalar(_)) => Err(VariableError::NotArray {
                op: VariableOp::Get,
                name: name.to_string(),
                index: String::new(),
            }),
            None => Err(VariableError::Missing {
                op: VariableOp::Get,
                name: name.to_string(),
                suffix: FOR_THREAD,
            }),
        }
    }

    /// Element count of the calling thread's array.
    pub fn count(&self, name: &str) -> Result<usize, VariableError> {
        self.with_array(name, IndexMap::len)
    }

    /// Copy of the calling thread's array.
    pub fn list(&self, name: &str) -> Result<IndexMap<String, String>, VariableError> {
        self.with_array(name, Clone::clone)
    }

    /// Element names of the calling thread's array matching `pattern`, as a list.
    pub fn keys_to_string(
        &self,
        name: &str,
        mode: MatchMode,
        pattern: Option<&str>,
        no_case: bool,
    ) -> EngineResult<String> {
        let matcher = pattern.map(|p| Matcher::new(mode, p, no_case)).transpose()?;
        let keys = self.with_array(name, |elements| {
            elements
                .keys()
                .filter(|k| matcher.as_ref().is_none_or(|m| m.is_match(k)))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        Ok(make_list(keys))
    }

    /// Name/value pairs of the calling thread's array whose names glob-match
    /// `pattern`, as a flat list.
    pub fn keys_and_values_to_string(
        &self,
        name: &str,
        pattern: Option<&str>,
        no_case: bool,
    ) -> Result<String, VariableError> {
        let pairs = self.with_array(name, |elements| {
            elements
                .iter()
                .filter(|(k, _)| pattern.is_none_or(|p| glob_match(p, k, no_case)))
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .collect::<Vec<_>>()
        })?;
        Ok(make_list(pairs))
    }

    /// Listing of every thread's value. `full` includes array contents.
    pub fn to_string_full(&self, full: bool) -> String {
        let values = self.values.lock();
        let mut ids: Vec<_> = values.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| values.get(id).map(|slot| (id, slot)))
            .map(|(id, slot)| match slot {
                Slot::Scalar(value) => format!("{} <scalar> {}", id, quote_element(value)),
                Slot::Array(elements) if full => {
                    let flat = elements.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]);
                    format!("{} <array> {}", id, quote_element(&make_list(flat)))
                }
                Slot::Array(elements) => format!("{} <array> {}", id, elements.len()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ThreadVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_full(f.alternate()))
    }
}

impl VariableStorage for ThreadVariable {
    fn get(&self, access: &VariableAccess<'_>) -> Result<String, VariableError> {
        read_slot(self.values.lock().get(&access.thread_id), access, FOR_THREAD)
    }

    fn set(&self, access: &VariableAccess<'_>, value: &str) -> Result<String, VariableError> {
        let mut values = self.values.lock();
        let mut slot = values.remove(&access.thread_id);
        let result = write_slot(&mut slot, access, value);
        if let Some(slot) = slot {
            values.insert(access.thread_id, slot);
        }
        result
    }

    fn unset(&self, access: &VariableAccess<'_>) -> Result<(), VariableError> {
        let mut values = self.values.lock();
        let mut slot = values.remove(&access.thread_id);
        let result = remove_from_slot(&mut slot, access, FOR_THREAD, false);
        if let Some(slot) = slot {
            values.insert(access.thread_id, slot);
        }
        result
    }

    fn exists(&self, access: &VariableAccess<'_>) -> bool {
        slot_exists(self.values.lock().get(&access.thread_id), access.index)
    }

    fn as_thread_variable(&self) -> Option<&ThreadVariable> {
        Some(self)
    }
}

/// Totals from a cleanup sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Slots removed
    pub count: usize,
    /// Errors from individual sources
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold one source's outcome in. Returns whether the sweep continues.
    fn record(&mut self, source: &str, count: usize, outcome: EngineResult<()>, fail_fast: bool) -> bool {
        self.count += count;
        match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(source, error = %e, "thread variable cleanup error");
                self.errors.push(e.to_string());
                !fail_fast
            }
        }
    }
}

fn thread_variables(frame: &CallFrame) -> EngineResult<Vec<Arc<Variable>>> {
    Ok(frame
        .variables()?
        .into_iter()
        .filter(|v| v.thread_variable().is_some())
        .collect())
}

fn cleanup_frame(frame: &CallFrame, thread_id: u64) -> EngineResult<usize> {
    Ok(thread_variables(frame)?
        .iter()
        .filter_map(|v| v.thread_variable())
        .filter(|tv| tv.cleanup_for_thread(thread_id))
        .count())
}

/// Remove `thread_id`'s slot from every thread variable in the interpreter.
///
/// Scope frames, namespace variable frames and the global frame are swept in
/// turn. Errors from one source are collected and the sweep continues unless
/// `fail_fast` is set.
pub fn cleanup_for_thread(interpreter: &Interpreter, thread_id: u64, fail_fast: bool) -> CleanupReport {
    let _guard = interpreter.lock();
    let mut report = CleanupReport::default();

    'sweep: {
        let mut count = 0;
        let outcome = interpreter.for_each_scope(|frame| {
            count += cleanup_frame(frame, thread_id)?;
            Ok(())
        });
        if !report.record("scopes", count, outcome, fail_fast) {
            break 'sweep;
        }

        let mut count = 0;
        let outcome = interpreter.for_each_namespace(|namespace| {
            // The global namespace has no frame of its own.
            if let Some(frame) = namespace.variable_frame() {
                count += cleanup_frame(frame, thread_id)?;
            }
            Ok(())
        });
        if !report.record("namespaces", count, outcome, fail_fast) {
            break 'sweep;
        }

        let outcome = cleanup_frame(&interpreter.global_frame(), thread_id);
        let count = *outcome.as_ref().unwrap_or(&0);
        report.record("global", count, outcome.map(|_| ()), fail_fast);
    }

    if report.is_ok() {
        tracing::debug!(
            interpreter = interpreter.id(),
            thread_id,
            count = report.count,
            "thread variables cleaned up"
        );
    } else {
        tracing::warn!(
            interpreter = interpreter.id(),
            thread_id,
            count = report.count,
            errors = ?report.errors,
            "thread variable cleanup incomplete"
        );
    }
    report
}

/// Wipe every thread variable in the interpreter. Returns slots removed.
pub fn cleanup_for_all_threads(interpreter: &Interpreter) -> usize {
    let _guard = interpreter.lock();
    let mut frames = vec![interpreter.global_frame()];
    let _ = interpreter.for_each_scope(|frame| {
        frames.push(Arc::clone(frame));
        Ok(())
    });
    let _ = interpreter.for_each_namespace(|namespace| {
        if let Some(frame) = namespace.variable_frame() {
            frames.push(Arc::clone(frame));
        }
        Ok(())
    });

    frames
        .iter()
        .filter_map(|frame| thread_variables(frame).ok())
        .flatten()
        .filter_map(|v| v.thread_variable().map(ThreadVariable::cleanup_for_all))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access<'a>(name: &'a str, index: Option<&'a str>, thread_id: u64) -> VariableAccess<'a> {
        VariableAccess::new(name, index, thread_id)
    }

    #[test]
    fn test_values_are_per_thread() {
        let tv = ThreadVariable::new();
        tv.set(&access("x", None, 1), "one").unwrap();
        tv.set(&access("x", None, 2), "two").unwrap();
        assert_eq!(tv.get(&access("x", None, 1)).unwrap(), "one");
        assert_eq!(tv.get(&access("x", None, 2)).unwrap(), "two");
        assert_eq!(
            tv.get(&access("x", None, 3)).unwrap_err().to_string(),
            "can't read \"x\": no such variable for thread"
        );

        assert!(tv.cleanup_for_thread(1));
        assert!(!tv.cleanup_for_thread(1));
        assert_eq!(tv.get(&access("x", None, 2)).unwrap(), "two");
        assert_eq!(tv.cleanup_for_all(), 1);
        assert_eq!(tv.thread_count(), 0);
    }

    #[test]
    fn test_slot_shape_is_fixed() {
        let tv = ThreadVariable::new();
        tv.set(&access("a", Some("k"), 1), "v").unwrap();
        assert!(matches!(
            tv.set(&access("a", None, 1), "x"),
            Err(VariableError::IsArray { .. })
        ));
        assert!(matches!(
            tv.get(&access("a", None, 1)),
            Err(VariableError::IsArray { .. })
        ));
        // Whole arrays are not unset through the thread store.
        assert!(matches!(
            tv.unset(&access("a", None, 1)),
            Err(VariableError::IsArray { .. })
        ));
        assert!(matches!(
            tv.get(&access("a", Some("nope"), 1)),
            Err(VariableError::MissingElement { .. })
        ));
        tv.unset(&access("a", Some("k"), 1)).unwrap();
        assert!(tv.exists(&access("a", None, 1)));

        tv.set(&access("s", None, 2), "v").unwrap();
        assert!(matches!(
            tv.set(&access("s", Some("k"), 2), "x"),
            Err(VariableError::NotArray { .. })
        ));
        tv.unset(&access("s", None, 2)).unwrap();
        assert!(!tv.exists(&access("s", None, 2)));
        assert!(matches!(
            tv.unset(&access("s", None, 2)),
            Err(VariableError::Missing { .. })
        ));
    }

    #[test]
    fn test_append_policy() {
        let tv = ThreadVariable::new();
        let append = access("x", None, 1).with_flags(VariableFlags::APPEND_ELEMENT);
        tv.set(&append, "a").unwrap();
        assert_eq!(tv.set(&append, "b c").unwrap(), "a {b c}");
    }

    #[test]
    fn test_query_surface_for_current_thread() {
        let tv = ThreadVariable::new();
        let me = current_thread_id();
        assert!(!tv.does_exist());
        for (k, v) in [("alpha", "1"), ("beta", "2"), ("Alpine", "3")] {
            tv.set(&access("arr", Some(k), me), v).unwrap();
        }
        assert!(tv.does_exist());
        assert!(tv.does_element_exist(None));
        assert!(tv.does_element_exist(Some("beta")));
        assert!(!tv.does_element_exist(Some("gamma")));
        assert_eq!(tv.count("arr").unwrap(), 3);
        assert_eq!(tv.list("arr").unwrap().get("beta").map(String::as_str), Some("2"));

        assert_eq!(
            tv.keys_to_string("arr", MatchMode::Glob, Some("al*"), true).unwrap(),
            "alpha Alpine"
        );
        assert_eq!(
            tv.keys_to_string("arr", MatchMode::Exact, Some("beta"), false).unwrap(),
            "beta"
        );
        assert_eq!(
            tv.keys_to_string("arr", MatchMode::RegExp, Some("^A"), false).unwrap(),
            "Alpine"
        );
        assert_eq!(
            tv.keys_and_values_to_string("arr", Some("b*"), false).unwrap(),
            "beta 2"
        );
        assert_eq!(tv.keys_to_string("arr", MatchMode::Glob, None, false).unwrap(), "alpha beta Alpine");
    }

    #[test]
    fn test_display_lists_threads() {
        let tv = ThreadVariable::new();
        tv.set(&access("x", None, 1), "hello world").unwrap();
        tv.set(&access("x", Some("k"), 2), "v").unwrap();
        assert_eq!(tv.to_string(), "1 <scalar> {hello world}\n2 <array> 1");
        assert_eq!(format!("{:#}", tv), "1 <scalar> {hello world}\n2 <array> {k v}");
    }

    #[test]
    fn test_scalar_has_no_array_surface() {
        let tv = ThreadVariable::new();
        tv.set(&access("x", None, current_thread_id()), "v").unwrap();
        assert!(!tv.does_element_exist(None));
        assert!(tv.count("x").is_err());
    }
}
