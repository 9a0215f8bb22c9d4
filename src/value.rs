//! The runtime value representation.
//!
//! A [`Value`] is either `Null`, a short inline string, or a handle to a
//! heap object. The distilled specification this crate implements describes
//! the inline case as a pointer with its low bit tagged and the characters
//! packed into the remaining bytes of the word; in safe Rust the same idea
//! is expressed as a tagged enum variant holding a small fixed-size byte
//! array, which gives the identical "no heap allocation for short strings"
//! behavior without unsafe pointer tricks (see DESIGN.md).

use crate::heap::{Handle, Heap, ObjectKind};

/// Inline-string capacity, chosen to mirror the "pointer width minus the tag
/// byte" budget the spec describes for a 64-bit host (6 bytes).
pub const SHORT_STRING_CAP: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct ShortString {
    len: u8,
    bytes: [u8; SHORT_STRING_CAP],
}

impl ShortString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for ShortString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShortString({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Null,
    Str(ShortString),
    Heap(Handle),
}

impl Value {
    pub fn null() -> Self {
        Value::Null
    }

    /// Builds a string value, choosing the inline representation when it
    /// fits and otherwise allocating a heap string object.
    pub fn new_string(heap: &mut Heap, bytes: &[u8]) -> Self {
        if bytes.len() <= SHORT_STRING_CAP {
            let mut buf = [0u8; SHORT_STRING_CAP];
            buf[..bytes.len()].copy_from_slice(bytes);
            Value::Str(ShortString {
                len: bytes.len() as u8,
                bytes: buf,
            })
        } else {
            let handle = heap.alloc(ObjectKind::Str(bytes.to_vec().into_boxed_slice()), true);
            Value::Heap(handle)
        }
    }

    pub fn from_bool(b: bool) -> Self {
        if b {
            Value::Str(ShortString {
                len: 4,
                bytes: *b"true\0\0",
            })
        } else {
            Value::Null
        }
    }

    pub fn from_int(heap: &mut Heap, i: i64) -> Self {
        Value::new_string(heap, i.to_string().as_bytes())
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Heap(h) => Some(*h),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Null)
    }

    /// Reads a value as a byte string regardless of representation, copying
    /// into an owned buffer. This is the accessor most VM code should use;
    /// it matches the spec's "single read-as-string accessor" contract.
    pub fn read_string_owned(&self, heap: &Heap) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Str(s) => Some(s.as_bytes().to_vec()),
            Value::Heap(h) => match heap.get(*h) {
                ObjectKind::Str(bytes) => Some(bytes.to_vec()),
                _ => None,
            },
        }
    }

    /// Decimal coercion used by arithmetic/comparison opcodes. `None` means
    /// the value has no string reading at all (a closure, object, or
    /// coroutine thread) and the caller should panic rather than silently
    /// treat it as zero. A string value always succeeds, even with no
    /// leading digits (`"abc"` coerces to 0, the same way `DIV`/`MOD` treat
    /// a zero divisor as 0 rather than panicking).
    pub fn coerce_int(&self, heap: &Heap) -> Option<i64> {
        self.read_string_owned(heap).map(|bytes| parse_decimal_lenient(&bytes))
    }

    pub fn equals(&self, other: &Value, heap: &Heap) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Heap(a), Value::Heap(b)) if a == b => true,
            _ => match (self.read_string_owned(heap), other.read_string_owned(heap)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// Parses an optional leading `-` followed by ASCII digits, stopping at the
/// first non-digit. Returns 0 when no digits are present; never errors.
pub fn parse_decimal_lenient(bytes: &[u8]) -> i64 {
    let mut i = 0;
    let negative = bytes.first() == Some(&b'-');
    if negative {
        i += 1;
    }
    let mut value: i64 = 0;
    let mut any = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        any = true;
        value = value.saturating_mul(10).saturating_add((bytes[i] - b'0') as i64);
        i += 1;
    }
    if !any {
        return 0;
    }
    if negative {
        -value
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_parse() {
        assert_eq!(parse_decimal_lenient(b""), 0);
        assert_eq!(parse_decimal_lenient(b"-"), 0);
        assert_eq!(parse_decimal_lenient(b"42"), 42);
        assert_eq!(parse_decimal_lenient(b"-42"), -42);
        assert_eq!(parse_decimal_lenient(b"12abc"), 12);
    }

    #[test]
    fn short_string_roundtrip() {
        let mut heap = Heap::new(Default::default());
        let v = Value::new_string(&mut heap, b"hi");
        assert_eq!(v.read_string_owned(&heap).unwrap(), b"hi");
    }

    #[test]
    fn long_string_allocates_on_heap() {
        let mut heap = Heap::new(Default::default());
        let v = Value::new_string(&mut heap, b"this is definitely longer than six bytes");
        assert!(matches!(v, Value::Heap(_)));
        assert_eq!(
            v.read_string_owned(&heap).unwrap(),
            b"this is definitely longer than six bytes"
        );
    }

    #[test]
    fn equals_is_content_based() {
        let mut heap = Heap::new(Default::default());
        let a = Value::new_string(&mut heap, b"this is definitely longer than six bytes");
        let b = Value::new_string(&mut heap, b"this is definitely longer than six bytes");
        assert!(a.equals(&b, &heap));
    }
}
