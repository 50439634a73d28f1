//! The object arena and its mark–sweep collector.
//!
//! `Heap` itself is a dumb arena: it knows how to allocate, trace, and free
//! [`HeapData`] entries, but it has no idea what a value stack or a call
//! frame is. The [`crate::vm::Vm`] decides *when* to trigger a collection
//! (on an allocation that crosses the threshold, or on every allocation
//! under `--stress-gc`) and supplies the root set; `Heap` only does the
//! graph walk.

mod gc;
mod object;

pub use object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, HeapData, InstanceObj, MapKey, NativeFn,
    NativeFunctionObj, UpvalueObj,
};

use ahash::AHashMap;

/// An opaque handle to a heap-allocated object. Indices are reused once an
/// object is swept, but a `HeapId` only ever appears in contexts where the
/// referent is still reachable from some root, so stale reuse is never
/// observed from the language's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct Entry {
    marked: bool,
    data: HeapData,
}

/// Tuning knobs for the collector, set once at VM construction from CLI flags.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Run a full collection before every allocation, regardless of threshold.
    pub stress_gc: bool,
    /// Floor for `next_gc`; collections never trigger before this many bytes
    /// are live, even on the very first allocation.
    pub initial_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { stress_gc: false, initial_threshold: 1024 * 1024 }
    }
}

/// Monotonic counters exposed to the language through the `sys__mem_*`
/// native functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub objects_created: u64,
    pub next_gc: usize,
}

impl HeapStats {
    #[must_use]
    pub fn net_bytes(self) -> usize {
        self.bytes_allocated - self.bytes_freed
    }
}

pub struct Heap {
    entries: Vec<Option<Entry>>,
    free_list: Vec<u32>,
    /// Weak: string -> slot. Pruned of dead entries right after sweep so it
    /// never resurrects a string the mark phase did not reach.
    intern: AHashMap<Box<str>, HeapId>,
    gray_stack: Vec<HeapId>,
    stats: HeapStats,
    config: GcConfig,
}

impl Heap {
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            intern: AHashMap::new(),
            gray_stack: Vec::new(),
            stats: HeapStats { next_gc: config.initial_threshold, ..HeapStats::default() },
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> GcConfig {
        self.config
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Number of slots currently holding a live object, for the
    /// `sys__mem_get_live_objects` native.
    #[must_use]
    pub fn live_object_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Whether the VM should run a collection before the next allocation.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.config.stress_gc || self.stats.bytes_allocated - self.stats.bytes_freed > self.stats.next_gc
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries[id.index()]
            .as_ref()
            .map(|e| &e.data)
            .expect("HeapId referenced a freed slot")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries[id.index()]
            .as_mut()
            .map(|e| &mut e.data)
            .expect("HeapId referenced a freed slot")
    }

    #[must_use]
    pub fn get_string(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::String(s) => s,
            other => unreachable!("HeapId did not reference a string, got {other:?}"),
        }
    }

    /// Allocates a raw object with no interning. Callers that need GC
    /// pressure tracking go through [`crate::vm::Vm::alloc`] instead, which
    /// wraps this with the threshold check and root collection.
    pub fn alloc_raw(&mut self, data: HeapData) -> HeapId {
        let size = data.approx_size();
        self.stats.bytes_allocated += size;
        self.stats.objects_created += 1;
        let entry = Entry { marked: false, data };
        if let Some(slot) = self.free_list.pop() {
            self.entries[slot as usize] = Some(entry);
            HeapId(slot)
        } else {
            let id = HeapId(u32::try_from(self.entries.len()).expect("heap exceeded u32 capacity"));
            self.entries.push(Some(entry));
            id
        }
    }

    /// Interns `s`, allocating a new String object only if this exact byte
    /// sequence has not been seen (and survived collection) before.
    pub fn intern_string(&mut self, s: &str) -> HeapId {
        if let Some(&id) = self.intern.get(s) {
            return id;
        }
        let id = self.alloc_raw(HeapData::String(s.into()));
        self.intern.insert(s.into(), id);
        id
    }

    /// Runs a full mark–sweep collection rooted at `roots`. Called by the VM
    /// once it has gathered every live reference from the stack, call
    /// frames, globals, open upvalues, and (while compiling) the compiler's
    /// own function stack.
    pub fn collect_garbage(&mut self, roots: Vec<HeapId>) {
        gc::collect(self, roots);
    }
}
