//! Variable records and pluggable storage backends.
//!
//! A declared [`Variable`] delegates its get/set/unset operations to a
//! [`VariableStorage`] backend. [`FrameStorage`] keeps a single value owned
//! by the declaring frame; `ThreadVariable` partitions values by thread.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{VariableError, VariableOp};
use crate::flags::VariableFlags;
use crate::text::quote_element;
use crate::thread_variable::ThreadVariable;

/// Stored value: a scalar or an array of named elements. A slot never
/// changes shape once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Scalar(String),
    Array(IndexMap<String, String>),
}

impl Slot {
    pub fn is_array(&self) -> bool {
        matches!(self, Slot::Array(_))
    }
}

/// One variable operation as seen by a storage backend.
#[derive(Debug, Clone, Copy)]
pub struct VariableAccess<'a> {
    pub name: &'a str,
    pub index: Option<&'a str>,
    /// Thread performing the access
    pub thread_id: u64,
    pub flags: VariableFlags,
}

impl<'a> VariableAccess<'a> {
    pub fn new(name: &'a str, index: Option<&'a str>, thread_id: u64) -> Self {
        Self {
            name,
            index,
            thread_id,
            flags: VariableFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: VariableFlags) -> Self {
        self.flags = flags;
        self
    }

    fn missing(&self, op: VariableOp, suffix: &'static str) -> VariableError {
        VariableError::Missing {
            op,
            name: self.name.to_string(),
            suffix,
        }
    }

    fn is_array(&self, op: VariableOp) -> VariableError {
        VariableError::IsArray {
            op,
            name: self.name.to_string(),
        }
    }

    fn not_array(&self, op: VariableOp, index: &str) -> VariableError {
        VariableError::NotArray {
            op,
            name: self.name.to_string(),
            index: index.to_string(),
        }
    }

    fn missing_element(&self, op: VariableOp, index: &str) -> VariableError {
        VariableError::MissingElement {
            op,
            name: self.name.to_string(),
            index: index.to_string(),
        }
    }
}

/// Storage strategy behind a declared variable.
pub trait VariableStorage: Send + Sync + fmt::Debug {
    fn get(&self, access: &VariableAccess<'_>) -> Result<String, VariableError>;

    /// Store a value, returning the value now held.
    fn set(&self, access: &VariableAccess<'_>, value: &str) -> Result<String, VariableError>;

    fn unset(&self, access: &VariableAccess<'_>) -> Result<(), VariableError>;

    fn exists(&self, access: &VariableAccess<'_>) -> bool;

    /// Downcast hook used by thread cleanup.
    fn as_thread_variable(&self) -> Option<&ThreadVariable> {
        None
    }
}

/// Combine an old and a new value according to the append flags.
pub fn combine_values(flags: VariableFlags, old: Option<&str>, new: &str) -> String {
    let old = old.unwrap_or("");
    if flags.contains(VariableFlags::APPEND_ELEMENT) {
        if old.is_empty() {
            quote_element(new)
        } else {
            format!("{} {}", old, quote_element(new))
        }
    } else if flags.contains(VariableFlags::APPEND_VALUE) {
        format!("{}{}", old, new)
    } else {
        new.to_string()
    }
}

pub(crate) fn read_slot(
    slot: Option<&Slot>,
    access: &VariableAccess<'_>,
    suffix: &'static str,
) -> Result<String, VariableError> {
    let op = VariableOp::Get;
    match (slot, access.index) {
        (None, _) => Err(access.missing(op, suffix)),
        (Some(Slot::Scalar(value)), None) => Ok(value.clone()),
        (Some(Slot::Scalar(_)), Some(index)) => Err(access.not_array(op, index)),
        (Some(Slot::Array(_)), None) => Err(access.is_array(op)),
        (Some(Slot::Array(elements)), Some(index)) => elements
            .get(index)
            .cloned()
            .ok_or_else(|| access.missing_element(op, index)),
    }
}

/// Write into `slot`, creating it with the access's shape when empty.
pub(crate) fn write_slot(
    slot: &mut Option<Slot>,
    access: &VariableAccess<'_>,
    value: &str,
) -> Result<String, VariableError> {
    let op = VariableOp::Set;
    match (slot.as_mut(), access.index) {
        (None, None) => {
            let value = combine_values(access.flags, None, value);
            *slot = Some(Slot::Scalar(value.clone()));
            Ok(value)
        }
        (None, Some(index)) => {
            let value = combine_values(access.flags, None, value);
            let mut elements = IndexMap::new();
            elements.insert(index.to_string(), value.clone());
            *slot = Some(Slot::Array(elements));
            Ok(value)
        }
        (Some(Slot::Scalar(old)), None) => {
            let value = combine_values(access.flags, Some(old), value);
            *old = value.clone();
            Ok(value)
        }
        (Some(Slot::Scalar(_)), Some(index)) => Err(access.not_array(op, index)),
        (Some(Slot::Array(_)), None) => Err(access.is_array(op)),
        (Some(Slot::Array(elements)), Some(index)) => {
            let value = combine_values(access.flags, elements.get(index).map(String::as_str), value);
            elements.insert(index.to_string(), value.clone());
            Ok(value)
        }
    }
}

/// Remove from `slot`. Whole arrays are only removable when `whole_array`.
pub(crate) fn remove_from_slot(
    slot: &mut Option<Slot>,
    access: &VariableAccess<'_>,
    suffix: &'static str,
    whole_array: bool,
) -> Result<(), VariableError> {
    let op = VariableOp::Unset;
    match (slot.as_mut(), access.index) {
        (None, _) => Err(access.missing(op, suffix)),
        (Some(Slot::Scalar(_)), None) => {
            *slot = None;
            Ok(())
        }
        (Some(Slot::Scalar(_)), Some(index)) => Err(access.not_array(op, index)),
        (Some(Slot::Array(_)), None) if whole_array => {
            *slot = None;
            Ok(())
        }
        (Some(Slot::Array(_)), None) => Err(access.is_array(op)),
        (Some(Slot::Array(elements)), Some(index)) => elements
            .shift_remove(index)
            .map(|_| ())
            .ok_or_else(|| access.missing_element(op, index)),
    }
}

pub(crate) fn slot_exists(slot: Option<&Slot>, index: Option<&str>) -> bool {
    match (slot, index) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(Slot::Scalar(_)), Some(_)) => false,
        (Some(Slot::Array(elements)), Some(index)) => elements.contains_key(index),
    }
}

/// Default backend: one value held by the declaring frame.
#[derive(Debug, Default)]
pub struct FrameStorage {
    slot: Mutex<Option<Slot>>,
}

impl FrameStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VariableStorage for FrameStorage {
    fn get(&self, access: &VariableAccess<'_>) -> Result<String, VariableError> {
        read_slot(self.slot.lock().as_ref(), access, "")
    }

    fn set(&self, access: &VariableAccess<'_>, value: &str) -> Result<String, VariableError> {
        write_slot(&mut self.slot.lock(), access, value)
    }

    fn unset(&self, access: &VariableAccess<'_>) -> Result<(), VariableError> {
        remove_from_slot(&mut self.slot.lock(), access, "", true)
    }

    fn exists(&self, access: &VariableAccess<'_>) -> bool {
        slot_exists(self.slot.lock().as_ref(), access.index)
    }
}

/// A declared variable.
#[derive(Debug)]
pub struct Variable {
    name: String,
    flags: Mutex<VariableFlags>,
    storage: Arc<dyn VariableStorage>,
}

impl Variable {
    pub fn new(name: impl Into<String>, flags: VariableFlags, storage: Arc<dyn VariableStorage>) -> Self {
        Self {
            name: name.into(),
            flags: Mutex::new(flags),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> VariableFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: VariableFlags, on: bool) {
        self.flags.lock().set(flags, on);
    }

    pub fn storage(&self) -> &Arc<dyn VariableStorage> {
        &self.storage
    }

    /// The thread-partitioned backend, if this is a thread variable.
    pub fn thread_variable(&self) -> Option<&ThreadVariable> {
        self.storage.as_thread_variable()
    }

    pub fn get(&self, access: &VariableAccess<'_>) -> Result<String, VariableError> {
        self.storage.get(access)
    }

    pub fn set(&self, access: &VariableAccess<'_>, value: &str) -> Result<String, VariableError> {
        let value = self.storage.set(access, value)?;
        let mut flags = self.flags.lock();
        flags.remove(VariableFlags::UNDEFINED);
        flags.insert(VariableFlags::DIRTY);
        Ok(value)
    }

    pub fn unset(&self, access: &VariableAccess<'_>) -> Result<(), VariableError> {
        self.storage.unset(access)?;
        self.flags.lock().insert(VariableFlags::DIRTY);
        Ok(())
    }

    pub fn exists(&self, access: &VariableAccess<'_>) -> bool {
        self.storage.exists(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access<'a>(name: &'a str, index: Option<&'a str>) -> VariableAccess<'a> {
        VariableAccess::new(name, index, 1)
    }

    #[test]
    fn test_combine_values() {
        assert_eq!(combine_values(VariableFlags::empty(), Some("a"), "b"), "b");
        assert_eq!(combine_values(VariableFlags::APPEND_VALUE, Some("a"), "b"), "ab");
        assert_eq!(combine_values(VariableFlags::APPEND_ELEMENT, Some("a"), "b c"), "a {b c}");
        assert_eq!(combine_values(VariableFlags::APPEND_ELEMENT, None, "x"), "x");
    }

    #[test]
    fn test_frame_storage_scalar() {
        let storage = FrameStorage::new();
        assert_eq!(
            storage.get(&access("x", None)).unwrap_err().to_string(),
            "can't read \"x\": no such variable"
        );
        storage.set(&access("x", None), "1").unwrap();
        assert_eq!(storage.get(&access("x", None)).unwrap(), "1");
        assert!(matches!(
            storage.set(&access("x", Some("a")), "2"),
            Err(VariableError::NotArray { .. })
        ));
        storage.unset(&access("x", None)).unwrap();
        assert!(!storage.exists(&access("x", None)));
    }

    #[test]
    fn test_frame_storage_array() {
        let storage = FrameStorage::new();
        storage.set(&access("a", Some("k")), "v").unwrap();
        let append = access("a", Some("k")).with_flags(VariableFlags::APPEND_VALUE);
        assert_eq!(storage.set(&append, "w").unwrap(), "vw");
        assert!(storage.exists(&access("a", Some("k"))));
        assert!(!storage.exists(&access("a", Some("z"))));
        assert!(matches!(
            storage.get(&access("a", None)),
            Err(VariableError::IsArray { .. })
        ));
        assert!(matches!(
            storage.unset(&access("a", Some("z"))),
            Err(VariableError::MissingElement { .. })
        ));
        // The default backend can drop a whole array.
        storage.unset(&access("a", None)).unwrap();
        assert!(!storage.exists(&access("a", None)));
    }

    #[test]
    fn test_variable_tracks_dirty_flag() {
        let variable = Variable::new(
            "x",
            VariableFlags::UNDEFINED,
            Arc::new(FrameStorage::new()),
        );
        variable.set(&access("x", None), "1").unwrap();
        assert!(variable.flags().contains(VariableFlags::DIRTY));
        assert!(!variable.flags().contains(VariableFlags::UNDEFINED));
        assert!(variable.thread_variable().is_none());
    }
}
