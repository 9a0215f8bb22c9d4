//! Host-attachable type descriptors.
//!
//! A plain object can optionally carry a [`TypeDescriptor`] that gives it a
//! destructor (run once during sweep/shutdown) and/or a `next` hook that lets
//! the host turn the object into a producer the `NEXT`/`NEXT_S` instructions
//! can resume synchronously, just like a coroutine.

use crate::error::VmResult;
use crate::heap::{Handle, Heap, ObjectKind};
use crate::value::Value;

pub type DestructorFn = Box<dyn Fn(&ObjectKind)>;
pub type NextFn = Box<dyn Fn(&mut Heap, Handle, usize) -> VmResult<Option<Value>>>;

pub struct TypeDescriptor {
    pub name: String,
    pub destructor: Option<DestructorFn>,
    pub next: Option<NextFn>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destructor: None,
            next: None,
        }
    }

    pub fn with_destructor(mut self, f: DestructorFn) -> Self {
        self.destructor = Some(f);
        self
    }

    pub fn with_next(mut self, f: NextFn) -> Self {
        self.next = Some(f);
        self
    }
}
