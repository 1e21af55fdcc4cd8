//! The heap: arena allocation and mark-and-sweep collection
//!
//! All objects live in a slab of slots indexed by [`ObjId`]; a free list
//! threads the vacant slots. The slab doubles as the all-objects list the
//! sweep walks — freeing an object vacates its slot. The heap also owns the
//! string intern pool and the gray worklist.
//!
//! Collection is split between the heap and its caller: the caller marks
//! its roots with [`Heap::mark_value`] / [`Heap::mark_object`] /
//! [`Heap::mark_table`], then calls [`Heap::collect`], which traces the
//! gray worklist, reconciles the weak intern pool, sweeps, and resets the
//! growth threshold. The gray worklist is an ordinary `Vec` outside the
//! arena, so marking never re-enters collection.
//!
//! Allocation never collects on its own; callers check
//! [`Heap::should_collect`] at their allocation points while every
//! in-flight object is still reachable from a root.

use crate::object::{Obj, StringData, UpvalueState};
use crate::table::Table;
use crate::value::{Value, hash_bytes};

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_AT: usize = 1024 * 1024;

/// Handle to a heap object. Plain index; the arena owns the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(u32);

impl ObjId {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    obj: Option<Obj>,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Intern pool: keys are string values, values are nil. Weak — entries
    /// for unmarked strings are dropped between mark and sweep.
    strings: Table,
    gray: Vec<ObjId>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_AT,
        }
    }

    /// Place an object in the arena and return its handle. The caller is
    /// responsible for having collected first (see module docs): the new
    /// object is unreachable until the caller roots it.
    pub fn alloc(&mut self, obj: Obj) -> ObjId {
        self.bytes_allocated += obj.size_estimate();
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Slot {
                    marked: false,
                    obj: Some(obj),
                };
                ObjId(index)
            }
            None => {
                self.slots.push(Slot {
                    marked: false,
                    obj: Some(obj),
                });
                ObjId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// True when enough has been allocated that the next allocation point
    /// should run a collection first. Always true under `gc-stress`.
    pub fn should_collect(&self) -> bool {
        if cfg!(feature = "gc-stress") {
            true
        } else {
            self.bytes_allocated > self.next_gc
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn live_object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.obj.is_some()).count()
    }

    // ---- interning ----

    /// Intern borrowed bytes, returning the canonical handle for this
    /// content.
    pub fn intern(&mut self, chars: &str) -> ObjId {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(id) = self.strings.find_string(chars, hash, self) {
            return id;
        }
        self.insert_string(chars.into(), hash)
    }

    /// Intern an owned buffer (e.g. a concatenation result) without
    /// recopying when the content is new.
    pub fn intern_owned(&mut self, chars: String) -> ObjId {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(id) = self.strings.find_string(&chars, hash, self) {
            return id;
        }
        self.insert_string(chars.into_boxed_str(), hash)
    }

    /// Content lookup in the intern pool.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<ObjId> {
        self.strings.find_string(chars, hash, self)
    }

    fn insert_string(&mut self, chars: Box<str>, hash: u32) -> ObjId {
        let id = self.alloc(Obj::String(StringData { chars, hash }));
        self.strings.set(Value::Obj(id), hash, Value::Nil);
        id
    }

    // ---- access ----

    pub fn get(&self, id: ObjId) -> &Obj {
        match &self.slots[id.0 as usize].obj {
            Some(obj) => obj,
            None => panic!("use of freed object {id:?}"),
        }
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        match &mut self.slots[id.0 as usize].obj {
            Some(obj) => obj,
            None => panic!("use of freed object {id:?}"),
        }
    }

    pub fn string_data(&self, id: ObjId) -> &crate::object::StringData {
        match self.get(id) {
            Obj::String(data) => data,
            other => panic!("expected string object, found {other:?}"),
        }
    }

    pub fn as_str(&self, id: ObjId) -> &str {
        &self.string_data(id).chars
    }

    pub fn function(&self, id: ObjId) -> &crate::object::FunctionData {
        match self.get(id) {
            Obj::Function(data) => data,
            other => panic!("expected function object, found {other:?}"),
        }
    }

    pub fn function_mut(&mut self, id: ObjId) -> &mut crate::object::FunctionData {
        match self.get_mut(id) {
            Obj::Function(data) => data,
            other => panic!("expected function object, found {other:?}"),
        }
    }

    pub fn closure(&self, id: ObjId) -> &crate::object::ClosureData {
        match self.get(id) {
            Obj::Closure(data) => data,
            other => panic!("expected closure object, found {other:?}"),
        }
    }

    pub fn closure_mut(&mut self, id: ObjId) -> &mut crate::object::ClosureData {
        match self.get_mut(id) {
            Obj::Closure(data) => data,
            other => panic!("expected closure object, found {other:?}"),
        }
    }

    pub fn upvalue(&self, id: ObjId) -> &crate::object::UpvalueData {
        match self.get(id) {
            Obj::Upvalue(data) => data,
            other => panic!("expected upvalue object, found {other:?}"),
        }
    }

    pub fn upvalue_mut(&mut self, id: ObjId) -> &mut crate::object::UpvalueData {
        match self.get_mut(id) {
            Obj::Upvalue(data) => data,
            other => panic!("expected upvalue object, found {other:?}"),
        }
    }

    pub fn list(&self, id: ObjId) -> &crate::object::ListData {
        match self.get(id) {
            Obj::List(data) => data,
            other => panic!("expected list object, found {other:?}"),
        }
    }

    pub fn list_mut(&mut self, id: ObjId) -> &mut crate::object::ListData {
        match self.get_mut(id) {
            Obj::List(data) => data,
            other => panic!("expected list object, found {other:?}"),
        }
    }

    pub fn map(&self, id: ObjId) -> &crate::object::MapData {
        match self.get(id) {
            Obj::Map(data) => data,
            other => panic!("expected map object, found {other:?}"),
        }
    }

    pub fn map_mut(&mut self, id: ObjId) -> &mut crate::object::MapData {
        match self.get_mut(id) {
            Obj::Map(data) => data,
            other => panic!("expected map object, found {other:?}"),
        }
    }

    // ---- collection ----

    pub fn is_marked(&self, id: ObjId) -> bool {
        self.slots[id.0 as usize].marked
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_object(id);
        }
    }

    pub fn mark_object(&mut self, id: ObjId) {
        let slot = &mut self.slots[id.0 as usize];
        if slot.obj.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(id);
    }

    /// Mark every key and value of a caller-owned table (e.g. globals).
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    /// Run a collection cycle. All roots must already be marked.
    pub fn collect(&mut self) {
        #[cfg(feature = "gc-log")]
        let before = self.bytes_allocated;
        #[cfg(feature = "gc-log")]
        tracing::debug!(bytes = before, "gc begin");

        self.trace_references();
        self.remove_white_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;

        #[cfg(feature = "gc-log")]
        tracing::debug!(
            collected = before.saturating_sub(self.bytes_allocated),
            bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    fn trace_references(&mut self) {
        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }
    }

    fn blacken(&mut self, id: ObjId) {
        let mut children: Vec<Value> = Vec::new();
        match self.get(id) {
            Obj::Closure(closure) => {
                children.push(Value::Obj(closure.function));
                children.extend(closure.upvalues.iter().map(|&up| Value::Obj(up)));
            }
            Obj::Function(function) => {
                if let Some(name) = function.name {
                    children.push(Value::Obj(name));
                }
                children.extend(function.chunk.constants.iter().copied());
            }
            Obj::Upvalue(upvalue) => {
                if let UpvalueState::Closed(value) = upvalue.state {
                    children.push(value);
                }
            }
            Obj::List(list) => children.extend(list.items.iter().copied()),
            Obj::Map(map) => {
                for (key, value) in map.entries.iter() {
                    children.push(key);
                    children.push(value);
                }
            }
            Obj::String(_) | Obj::Native(_) => {}
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// The intern pool must not keep strings alive: drop every entry whose
    /// string is unmarked before the sweep frees it.
    fn remove_white_strings(&mut self) {
        let Heap { strings, slots, .. } = self;
        strings.retain_keys(|key| match key {
            Value::Obj(id) => slots[id.index() as usize].marked,
            _ => true,
        });
    }

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.obj.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else if let Some(obj) = slot.obj.take() {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.size_estimate());
                self.free.push(index as u32);
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ListData;

    #[test]
    fn test_alloc_and_access() {
        let mut heap = Heap::new();
        let id = heap.intern("hi");
        assert_eq!(heap.as_str(id), "hi");
        assert_eq!(heap.live_object_count(), 1);
    }

    #[test]
    fn test_intern_deduplicates() {
        let mut heap = Heap::new();
        let a = heap.intern("same");
        let b = heap.intern("same");
        let c = heap.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_object_count(), 2);
    }

    #[test]
    fn test_sweep_frees_unmarked_and_keeps_marked() {
        let mut heap = Heap::new();
        let keep = heap.alloc(Obj::List(ListData::default()));
        let _drop = heap.alloc(Obj::List(ListData::default()));
        heap.mark_object(keep);
        heap.collect();
        assert_eq!(heap.live_object_count(), 1);
        assert!(!heap.is_marked(keep), "marks are cleared by the sweep");
        assert!(matches!(heap.get(keep), Obj::List(_)));
    }

    #[test]
    fn test_trace_reaches_list_items() {
        let mut heap = Heap::new();
        let s = heap.intern("kept alive through the list");
        let list = heap.alloc(Obj::List(ListData {
            items: vec![Value::Obj(s)],
        }));
        heap.mark_object(list);
        heap.collect();
        assert_eq!(heap.live_object_count(), 2);
        assert_eq!(heap.as_str(s), "kept alive through the list");
    }

    #[test]
    fn test_intern_pool_is_weak() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let doomed = heap.intern("doomed");
        let doomed_hash = heap.string_data(doomed).hash;
        heap.mark_object(kept);
        heap.collect();
        assert_eq!(heap.live_object_count(), 1);
        assert_eq!(heap.find_string("doomed", doomed_hash), None);
        // The content can be re-interned afterwards as a fresh object.
        let again = heap.intern("doomed");
        assert_eq!(heap.as_str(again), "doomed");
    }

    #[test]
    fn test_slots_are_reused_after_sweep() {
        let mut heap = Heap::new();
        let dead = heap.alloc(Obj::List(ListData::default()));
        heap.collect();
        let reborn = heap.alloc(Obj::List(ListData::default()));
        assert_eq!(dead.index(), reborn.index());
    }

    #[test]
    fn test_bytes_allocated_shrinks_after_collect() {
        let mut heap = Heap::new();
        let baseline = heap.bytes_allocated();
        heap.alloc(Obj::List(ListData {
            items: vec![Value::Nil; 1000],
        }));
        assert!(heap.bytes_allocated() > baseline);
        heap.collect();
        assert_eq!(heap.bytes_allocated(), baseline);
    }
}
