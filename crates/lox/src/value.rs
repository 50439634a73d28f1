use std::fmt;

use crate::heap::{Heap, HeapData, HeapId};

/// A tagged union of every value the VM can put on its stack.
///
/// `Value` is deliberately `Copy`: unlike a refcounted object model, nothing
/// here needs a destructor, so passing values around the interpreter is just
/// moving a few bytes. Heap-allocated payloads (strings, closures, lists, ...)
/// are referenced through [`HeapId`] and stay owned by the [`Heap`] arena.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Obj(HeapId),
}

impl Value {
    /// `false` and `nil` are falsy; everything else, including `0` and `""`, is truthy.
    #[must_use]
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    #[must_use]
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    #[must_use]
    pub fn as_obj(self) -> Option<HeapId> {
        match self {
            Value::Obj(id) => Some(id),
            _ => None,
        }
    }

    /// The name the `type()` native reports for this value.
    #[must_use]
    pub fn type_name(self, heap: &Heap) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Number(_) => "double",
            Value::Obj(id) => heap.get(id).type_name(),
        }
    }

    /// Whether this value may be used as a map key (primitives and strings
    /// compare by value; everything else would need identity semantics the
    /// map does not support, so lists and maps are rejected up front).
    #[must_use]
    pub fn is_hashable(self, heap: &Heap) -> bool {
        match self {
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Number(_) => true,
            Value::Obj(id) => matches!(
                heap.get(id),
                HeapData::String(_) | HeapData::Class(_) | HeapData::Instance(_)
            ),
        }
    }

    /// Renders this value the way `echo`, `print`, and `to_string` do.
    pub fn format(self, heap: &Heap, out: &mut dyn fmt::Write) -> fmt::Result {
        match self {
            Value::Nil => write!(out, "nil"),
            Value::Bool(b) => write!(out, "{b}"),
            Value::Int(i) => write!(out, "{i}"),
            Value::Number(n) => write!(out, "{}", format_number(n)),
            Value::Obj(id) => heap.get(id).format(heap, out),
        }
    }

    /// Convenience wrapper around [`Value::format`] for callers that just want a `String`.
    #[must_use]
    pub fn display_string(self, heap: &Heap) -> String {
        let mut s = String::new();
        // Writing to a String never fails.
        let _ = self.format(heap, &mut s);
        s
    }

    /// Lox equality: same-tag value equality, with int/double comparing
    /// equal when mathematically equal; everything else compares by identity
    /// (string identity is guaranteed by interning).
    #[must_use]
    pub fn lox_eq(self, other: Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Number(b)) | (Value::Number(b), Value::Int(a)) => {
                (a as f64) == b
            }
            _ => self == other,
        }
    }
}

/// Shortest round-trippable rendering that drops a trailing `.0` for integral doubles,
/// matching what the test corpus expects from plain numeric literals.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(n).to_string()
    }
}
