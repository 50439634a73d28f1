//! BFS mark-and-sweep, grounded on the arena-walk shape of a tracing
//! reference-graph collector: a gray work list seeded from the root set,
//! popped and scanned until empty, followed by a single linear sweep.

use crate::heap::{Heap, HeapData, HeapId};

pub(super) fn collect(heap: &mut Heap, roots: Vec<HeapId>) {
    mark(heap, roots);
    sweep(heap);
    heap.intern.retain(|_, id| heap.entries[id.index()].is_some());
    heap.stats.next_gc = (heap.stats.bytes_allocated - heap.stats.bytes_freed) * 2;
    if heap.stats.next_gc < heap.config.initial_threshold {
        heap.stats.next_gc = heap.config.initial_threshold;
    }
}

fn mark(heap: &mut Heap, roots: Vec<HeapId>) {
    debug_assert!(heap.gray_stack.is_empty());
    heap.gray_stack = roots;
    for &id in &heap.gray_stack {
        if let Some(entry) = heap.entries[id.index()].as_mut() {
            entry.marked = true;
        }
    }
    while let Some(id) = heap.gray_stack.pop() {
        let Some(entry) = heap.entries[id.index()].as_ref() else {
            continue;
        };
        let mut children = Vec::new();
        collect_child_ids(&entry.data, &mut children);
        for child in children {
            let already_marked = heap.entries[child.index()].as_ref().is_some_and(|e| e.marked);
            if !already_marked {
                if let Some(entry) = heap.entries[child.index()].as_mut() {
                    entry.marked = true;
                }
                heap.gray_stack.push(child);
            }
        }
    }
}

fn sweep(heap: &mut Heap) {
    for (index, slot) in heap.entries.iter_mut().enumerate() {
        let should_free = match slot {
            Some(entry) if entry.marked => {
                entry.marked = false;
                false
            }
            Some(_) => true,
            None => false,
        };
        if should_free {
            let freed = slot.take().expect("checked Some above");
            heap.stats.bytes_freed += freed.data.approx_size();
            heap.free_list.push(u32::try_from(index).expect("index came from a valid HeapId"));
        }
    }
}

/// Pushes every `HeapId` directly reachable from `data` onto `out`.
fn collect_child_ids(data: &HeapData, out: &mut Vec<HeapId>) {
    match data {
        HeapData::String(_) | HeapData::NativeFunction(_) => {}
        HeapData::Function(f) => {
            if let Some(name) = f.name {
                out.push(name);
            }
            for constant in &f.chunk.constants {
                if let Some(id) = constant.as_obj() {
                    out.push(id);
                }
            }
        }
        HeapData::Closure(c) => {
            out.push(c.function);
            out.extend(c.upvalues.iter().copied());
        }
        HeapData::Upvalue(u) => {
            if let crate::heap::UpvalueObj::Closed(v) = u {
                if let Some(id) = v.as_obj() {
                    out.push(id);
                }
            }
        }
        HeapData::Class(c) => {
            out.push(c.name);
            if let Some(sup) = c.superclass {
                out.push(sup);
            }
            for (&name, &method) in &c.methods {
                out.push(name);
                out.push(method);
            }
        }
        HeapData::Instance(i) => {
            out.push(i.class);
            for (&name, &value) in &i.fields {
                out.push(name);
                if let Some(id) = value.as_obj() {
                    out.push(id);
                }
            }
        }
        HeapData::BoundMethod(b) => {
            out.push(b.method);
            if let Some(id) = b.receiver.as_obj() {
                out.push(id);
            }
        }
        HeapData::List(items) => {
            for item in items {
                if let Some(id) = item.as_obj() {
                    out.push(id);
                }
            }
        }
        HeapData::Map(entries) => {
            for (key, value) in entries {
                if let Some(id) = key.0.as_obj() {
                    out.push(id);
                }
                if let Some(id) = value.as_obj() {
                    out.push(id);
                }
            }
        }
    }
}
