//! The interpreter value stack.
//!
//! Indices at the bridge boundary follow interpreter convention: 1-based
//! absolute from the bottom, negative from the top (`-1` is the top value).

use crate::script::value::ScriptValue;

#[derive(Default)]
pub struct ScriptStack {
    slots: Vec<ScriptValue>,
}

impl ScriptStack {
    pub fn new() -> ScriptStack {
        ScriptStack::default()
    }

    /// Number of values on the stack; also the absolute index of the top.
    pub fn top(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, value: ScriptValue) {
        self.slots.push(value);
    }

    pub fn pop(&mut self, count: usize) {
        let len = self.slots.len().saturating_sub(count);
        self.slots.truncate(len);
    }

    pub fn pop_value(&mut self) -> Option<ScriptValue> {
        self.slots.pop()
    }

    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// Converts an interpreter index to a 0-based slot index.
    pub fn abs_index(&self, index: i32) -> Option<usize> {
        let len = self.slots.len() as i64;
        let abs = if index > 0 {
            index as i64
        } else if index < 0 {
            len + index as i64 + 1
        } else {
            return None;
        };
        if abs >= 1 && abs <= len {
            Some(abs as usize - 1)
        } else {
            None
        }
    }

    pub fn value(&self, index: i32) -> Option<&ScriptValue> {
        self.abs_index(index).map(|i| &self.slots[i])
    }

    pub fn set_value(&mut self, index: i32, value: ScriptValue) -> bool {
        match self.abs_index(index) {
            Some(i) => {
                self.slots[i] = value;
                true
            }
            None => false,
        }
    }

    /// Removes `len` values starting at 1-based absolute index `start`,
    /// shifting everything above down.
    pub fn remove_span(&mut self, start: usize, len: usize) {
        if start == 0 || start > self.slots.len() || len == 0 {
            return;
        }
        let end = (start - 1 + len).min(self.slots.len());
        self.slots.drain(start - 1..end);
    }
}
