use std::fmt;

use ahash::AHashMap;

use crate::chunk::Chunk;
use crate::heap::{Heap, HeapId};
use crate::value::Value;

/// A compiled function body: its chunk, and enough metadata for the call
/// protocol and closure creation to operate without consulting the compiler.
#[derive(Debug)]
pub struct FunctionObj {
    pub name: Option<HeapId>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

impl FunctionObj {
    #[must_use]
    pub fn display_name<'a>(&self, heap: &'a Heap) -> &'a str {
        match self.name {
            Some(id) => heap.get_string(id),
            None => "<script>",
        }
    }
}

pub type NativeFn =
    fn(&[Value], &mut Heap, &mut dyn std::io::Write) -> Result<Value, crate::error::RuntimeError>;

pub struct NativeFunctionObj {
    pub name: &'static str,
    pub arity: Option<u8>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunctionObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunctionObj").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

#[derive(Debug)]
pub enum UpvalueObj {
    /// Points at an absolute index in the VM's value stack.
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: HeapId,
    pub methods: AHashMap<HeapId, HeapId>,
    pub superclass: Option<HeapId>,
    pub init: Option<HeapId>,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: HeapId,
    pub fields: AHashMap<HeapId, Value>,
}

#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: HeapId,
}

/// A key wrapper giving [`Value`] the `Eq`/`Hash` a map needs. NaN keys are
/// not produced by any in-language path that reaches here, so bit-pattern
/// hashing is safe in practice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapKey(pub Value);

impl Eq for MapKey {}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self.0 {
            Value::Nil => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Number(n) => {
                3u8.hash(state);
                n.to_bits().hash(state);
            }
            Value::Obj(id) => {
                4u8.hash(state);
                id.index().hash(state);
            }
        }
    }
}

#[derive(Debug)]
pub enum HeapData {
    String(Box<str>),
    Function(FunctionObj),
    NativeFunction(NativeFunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(Vec<Value>),
    Map(indexmap::IndexMap<MapKey, Value, ahash::RandomState>),
}

impl HeapData {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapData::String(_) => "string",
            HeapData::Function(_) | HeapData::Closure(_) | HeapData::NativeFunction(_) => {
                "function"
            }
            HeapData::Upvalue(_) => "upvalue",
            HeapData::Class(_) => "class",
            HeapData::Instance(_) => "instance",
            HeapData::BoundMethod(_) => "method",
            HeapData::List(_) => "list",
            HeapData::Map(_) => "map",
        }
    }

    /// An approximate byte footprint used only by the GC introspection
    /// natives; it need not match the host allocator exactly, only be
    /// monotonic and consistent between allocation and free of the same
    /// object.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<HeapData>();
        base + match self {
            HeapData::String(s) => s.len(),
            HeapData::Closure(c) => c.upvalues.len() * std::mem::size_of::<HeapId>(),
            HeapData::Class(c) => c.methods.len() * 2 * std::mem::size_of::<HeapId>(),
            HeapData::Instance(i) => i.fields.len() * std::mem::size_of::<Value>(),
            HeapData::List(l) => l.len() * std::mem::size_of::<Value>(),
            HeapData::Map(m) => m.len() * 2 * std::mem::size_of::<Value>(),
            HeapData::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>(),
            HeapData::Upvalue(_) | HeapData::NativeFunction(_) | HeapData::BoundMethod(_) => 0,
        }
    }

    pub fn format(&self, heap: &Heap, out: &mut dyn fmt::Write) -> fmt::Result {
        match self {
            HeapData::String(s) => write!(out, "{s}"),
            HeapData::Function(f) => write!(out, "<fn {}>", f.display_name(heap)),
            HeapData::NativeFunction(n) => write!(out, "<native fn {}>", n.name),
            HeapData::Closure(c) => {
                let HeapData::Function(f) = heap.get(c.function) else {
                    unreachable!("closure must point at a Function object")
                };
                write!(out, "<fn {}>", f.display_name(heap))
            }
            HeapData::Upvalue(_) => write!(out, "<upvalue>"),
            HeapData::Class(c) => write!(out, "{}", heap.get_string(c.name)),
            HeapData::Instance(i) => {
                let HeapData::Class(c) = heap.get(i.class) else {
                    unreachable!("instance must point at a Class object")
                };
                write!(out, "{} instance", heap.get_string(c.name))
            }
            HeapData::BoundMethod(b) => {
                let HeapData::Closure(c) = heap.get(b.method) else {
                    unreachable!("bound method must point at a Closure object")
                };
                let HeapData::Function(f) = heap.get(c.function) else {
                    unreachable!("closure must point at a Function object")
                };
                write!(out, "<fn {}>", f.display_name(heap))
            }
            HeapData::List(items) => {
                write!(out, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(out, ", ")?;
                    }
                    item.format(heap, out)?;
                }
                write!(out, "]")
            }
            HeapData::Map(entries) => {
                write!(out, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(out, ", ")?;
                    }
                    k.0.format(heap, out)?;
                    write!(out, ": ")?;
                    v.format(heap, out)?;
                }
                write!(out, "}}")
            }
        }
    }
}
