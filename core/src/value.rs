//! Runtime values.
//!
//! A `Value` is a small `Copy` scalar: numbers, booleans, nil, and handles
//! into the object heap. Everything bigger than a machine word lives behind
//! an [`ObjRef`] and is owned by the [`Heap`].

use std::hash::Hasher;

use anyhow::{Result, bail};
use rustc_hash::FxHasher;

use crate::heap::{Heap, ObjRef};
use crate::objects::ObjectKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Nil,
    Obj(ObjRef),
}

impl Value {
    #[inline]
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn as_obj(self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(r),
            _ => None,
        }
    }

    /// Conditionals treat `false` and `nil` as falsey, everything else as truthy.
    #[inline]
    pub fn is_truthy(self) -> bool {
        match self {
            Value::Bool(b) => b,
            Value::Nil => false,
            _ => true,
        }
    }

    /// Content equality. Strings compare by their bytes, all other object
    /// kinds by identity.
    pub fn equals(self, other: Value, heap: &Heap) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Obj(a), Value::Obj(b)) => {
                if a == b {
                    return true;
                }
                match (&heap.get(a).kind, &heap.get(b).kind) {
                    (ObjectKind::Str(sa), ObjectKind::Str(sb)) => sa.chars == sb.chars,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Hash for use as a table key. Only numbers, booleans, nil and strings
    /// are hashable; other object kinds fail and callers must guard.
    pub fn hash(self, heap: &Heap) -> Result<u64> {
        match self {
            Value::Number(n) => Ok(hash_number(n)),
            Value::Bool(b) => Ok(if b { 3 } else { 5 }),
            Value::Nil => Ok(7),
            Value::Obj(r) => match &heap.get(r).kind {
                ObjectKind::Str(s) => Ok(s.hash),
                kind => bail!("value of type '{}' is not hashable", kind.type_name()),
            },
        }
    }

    pub fn type_name(self, heap: &Heap) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Nil => "nil",
            Value::Obj(r) => heap.get(r).kind.type_name(),
        }
    }

    /// Human-readable rendering, used by `print` and error messages.
    pub fn format(self, heap: &Heap) -> String {
        match self {
            Value::Number(n) => format_number(n),
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Obj(r) => heap.format_object(r),
        }
    }
}

#[inline]
fn hash_number(n: f64) -> u64 {
    // Normalize -0.0 so that equal numbers hash equally.
    let n = if n == 0.0 { 0.0 } else { n };
    let mut hasher = FxHasher::default();
    hasher.write_u64(n.to_bits());
    hasher.finish()
}

pub fn hash_str(s: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// Integral numbers render without a trailing `.0`, everything else goes
/// through ryu's shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(n).to_string()
    }
}
