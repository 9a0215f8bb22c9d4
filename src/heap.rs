//! The runtime heap: object storage, GC list membership, and allocation.
//!
//! Every heap-allocated value (objects, strings too long to inline, function
//! templates, closures, environments, coroutine threads) lives in one arena
//! slot here. A [`Handle`] is a generational index into that arena rather than
//! a raw pointer, which keeps the whole VM free of `unsafe` while preserving
//! the object-list-plus-tracing discipline the garbage collector relies on.

use std::rc::Rc;

use crate::closure::{Closure, Environment};
use crate::function::FunctionTemplate;
use crate::object::table::Table;
use crate::object::type_descriptor::TypeDescriptor;
use crate::thread::Thread;

/// A generational handle to a heap object. Stale handles (after the slot has
/// been freed and reused) fail to resolve rather than aliasing a new object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// GC tri-color tag. See `gc.rs` for the collector that drives transitions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Color {
    White,
    Gray,
    Black,
}

/// The closed set of heap object kinds the runtime supports.
pub enum ObjectKind {
    /// A generic key/value object; also used as an "array" when its keys are
    /// the decimal stringifications of `0..len`.
    Object(Table),
    /// An immutable byte string too long to fit in the inline representation.
    Str(Box<[u8]>),
    Function(FunctionTemplate),
    Closure(Closure),
    Environment(Environment),
    Thread(Thread),
}

impl ObjectKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Object(_) => "object",
            ObjectKind::Str(_) => "string",
            ObjectKind::Function(_) => "function",
            ObjectKind::Closure(_) => "closure",
            ObjectKind::Environment(_) => "environment",
            ObjectKind::Thread(_) => "thread",
        }
    }
}

pub struct HeapObject {
    pub color: Color,
    prev: Option<Handle>,
    next: Option<Handle>,
    pub is_const: bool,
    /// Only meaningful for `ObjectKind::Object`: lets the host attach a
    /// destructor and/or a `next` iterator hook to a plain object.
    pub type_descriptor: Option<Rc<TypeDescriptor>>,
    pub kind: ObjectKind,
}

impl HeapObject {
    fn new(kind: ObjectKind, is_const: bool) -> Self {
        Self {
            color: Color::White,
            prev: None,
            next: None,
            is_const,
            type_descriptor: None,
            kind,
        }
    }
}

struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

#[derive(Default)]
pub(crate) struct GcLists {
    pub white: Option<Handle>,
    pub gray: Option<Handle>,
    pub black: Option<Handle>,
}

/// GC pacing knobs, host-configurable through the embedding API (`gc_conf`).
#[derive(Clone, Copy, Debug)]
pub struct GcConfig {
    pub gc_freq: u32,
    pub gc_step_size: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_freq: 1000,
            gc_step_size: 64,
        }
    }
}

pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    pub(crate) lists: GcLists,
    pub config: GcConfig,
    alloc_counter: u32,
    live_count: usize,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            lists: GcLists::default(),
            config,
            alloc_counter: 0,
            live_count: 0,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    fn object(&self, h: Handle) -> Option<&HeapObject> {
        self.slots.get(h.index as usize).and_then(|slot| {
            if slot.generation == h.generation {
                slot.object.as_ref()
            } else {
                None
            }
        })
    }

    fn object_mut(&mut self, h: Handle) -> Option<&mut HeapObject> {
        self.slots.get_mut(h.index as usize).and_then(|slot| {
            if slot.generation == h.generation {
                slot.object.as_mut()
            } else {
                None
            }
        })
    }

    pub fn get(&self, h: Handle) -> &ObjectKind {
        &self
            .object(h)
            .expect("stale or invalid heap handle")
            .kind
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut ObjectKind {
        &mut self
            .object_mut(h)
            .expect("stale or invalid heap handle")
            .kind
    }

    pub fn is_const(&self, h: Handle) -> bool {
        self.object(h).map(|o| o.is_const).unwrap_or(true)
    }

    pub fn set_const(&mut self, h: Handle) {
        if let Some(o) = self.object_mut(h) {
            o.is_const = true;
        }
    }

    pub fn type_descriptor(&self, h: Handle) -> Option<Rc<TypeDescriptor>> {
        self.object(h).and_then(|o| o.type_descriptor.clone())
    }

    pub fn set_type_descriptor(&mut self, h: Handle, td: Rc<TypeDescriptor>) {
        if let Some(o) = self.object_mut(h) {
            o.type_descriptor = Some(td);
        }
    }

    pub fn type_name(&self, h: Handle) -> &'static str {
        self.object(h)
            .map(|o| o.kind.type_name())
            .unwrap_or("freed")
    }

    /// Describes a [`crate::value::Value`] for error messages: `"null"`,
    /// `"string"`, or the heap object's own type name.
    pub fn type_name_of_value(&self, v: &crate::value::Value) -> String {
        match v {
            crate::value::Value::Null => "null".to_string(),
            crate::value::Value::Str(_) => "string".to_string(),
            crate::value::Value::Heap(h) => self.type_name(*h).to_string(),
        }
    }

    /// Allocates a new object. It starts white and is linked at the head of
    /// the unvisited list, and the allocation pacing counter is bumped.
    pub fn alloc(&mut self, kind: ObjectKind, is_const: bool) -> Handle {
        let object = HeapObject::new(kind, is_const);
        let handle = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            Handle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                object: Some(object),
            });
            Handle {
                index,
                generation: 0,
            }
        };

        self.link_front(handle, Color::White);
        self.live_count += 1;
        self.alloc_counter += 1;
        log::trace!("heap: allocated {:?} ({})", handle, self.type_name(handle));
        handle
    }

    /// Returns `true` when GC pacing says a step is due; resets the counter.
    pub fn should_step(&mut self) -> bool {
        if self.alloc_counter >= self.config.gc_freq {
            self.alloc_counter = 0;
            true
        } else {
            false
        }
    }

    /// Called whenever a black object is mutated: re-grey it so the
    /// tri-color invariant holds across the rest of the incremental cycle.
    pub fn write_barrier(&mut self, h: Handle) {
        if matches!(self.object(h).map(|o| o.color), Some(Color::Black)) {
            self.unlink(h);
            self.link_front(h, Color::Gray);
        }
    }

    pub(crate) fn mark_gray_if_white(&mut self, h: Handle) {
        if matches!(self.object(h).map(|o| o.color), Some(Color::White)) {
            self.unlink(h);
            self.link_front(h, Color::Gray);
        }
    }

    pub(crate) fn pop_gray(&mut self) -> Option<Handle> {
        self.lists.gray
    }

    pub(crate) fn mark_black(&mut self, h: Handle) {
        self.unlink(h);
        self.link_front(h, Color::Black);
    }

    /// Frees every object still on the white list, then promotes the black
    /// list to be the new white list (all colors reset) and clears gray
    /// (which must already be empty by this point).
    pub(crate) fn sweep(&mut self) {
        let mut cursor = self.lists.white;
        self.lists.white = None;
        while let Some(h) = cursor {
            let next = self.object(h).and_then(|o| o.next);
            self.finalize_and_free(h);
            cursor = next;
        }

        // The visited (black) list becomes the new unvisited (white) list;
        // its links are untouched, only the color tags need resetting.
        let new_white_head = self.lists.black.take();
        let mut cursor = new_white_head;
        while let Some(h) = cursor {
            let next = self.object(h).and_then(|o| o.next);
            if let Some(o) = self.object_mut(h) {
                o.color = Color::White;
            }
            cursor = next;
        }
        self.lists.white = new_white_head;
    }

    fn finalize_and_free(&mut self, h: Handle) {
        let index = h.index as usize;
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.generation == h.generation {
                if let Some(object) = slot.object.take() {
                    if let Some(td) = &object.type_descriptor {
                        if let Some(destructor) = &td.destructor {
                            destructor(&object.kind);
                        }
                    }
                    self.live_count -= 1;
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
            }
        }
    }

    fn unlink(&mut self, h: Handle) {
        let (prev, next, color) = match self.object(h) {
            Some(o) => (o.prev, o.next, o.color),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(po) = self.object_mut(p) {
                    po.next = next;
                }
            }
            None => {
                // `h` was the list head (invariant: head.prev == None).
                *self.head_mut(color) = next;
            }
        }

        if let Some(n) = next {
            if let Some(no) = self.object_mut(n) {
                no.prev = prev;
            }
        }
    }

    fn link_front(&mut self, h: Handle, color: Color) {
        let old_head = self.head(color);
        if let Some(o) = self.object_mut(h) {
            o.prev = None;
            o.next = old_head;
            o.color = color;
        }
        if let Some(oh) = old_head {
            if let Some(oo) = self.object_mut(oh) {
                oo.prev = Some(h);
            }
        }
        *self.head_mut(color) = Some(h);
    }

    fn head(&self, color: Color) -> Option<Handle> {
        match color {
            Color::White => self.lists.white,
            Color::Gray => self.lists.gray,
            Color::Black => self.lists.black,
        }
    }

    fn head_mut(&mut self, color: Color) -> &mut Option<Handle> {
        match color {
            Color::White => &mut self.lists.white,
            Color::Gray => &mut self.lists.gray,
            Color::Black => &mut self.lists.black,
        }
    }
}
