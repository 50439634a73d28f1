//! Native function registry: builtins implemented as plain `fn` pointers and
//! installed as globals before the top-level chunk runs. Each receives the
//! already-validated argument slice, the heap (to allocate results or read
//! objects), and the CLI's output sink (for `print`/`println`).
//!
//! Argument-count checking is split: a native with a fixed `arity` in its
//! [`NativeDef`] is checked by the VM before the call ever happens (see
//! `Vm::call_native`); a native that takes a variable number of arguments
//! (`arity: None`, e.g. `list(...)`) validates its own argc inline.

use std::hash::{Hash, Hasher};
use std::io::Write;

use rand::Rng;

use crate::error::RuntimeError;
use crate::heap::{Heap, HeapData, HeapId, MapKey, NativeFn};
use crate::value::Value;

pub struct NativeDef {
    pub name: &'static str,
    pub arity: Option<u8>,
    pub func: NativeFn,
}

#[must_use]
pub fn registry() -> Vec<NativeDef> {
    macro_rules! native {
        ($name:expr, $arity:expr, $func:expr) => {
            NativeDef { name: $name, arity: $arity, func: $func }
        };
    }
    vec![
        native!("sqrt", Some(1), native_sqrt),
        native!("rand", Some(0), native_rand),
        native!("randint", Some(2), native_randint),
        native!("list", None, native_list),
        native!("append", Some(2), native_append),
        native!("pop", Some(1), native_pop),
        native!("delete", Some(2), native_delete),
        native!("map", None, native_map),
        native!("keys", Some(1), native_keys),
        native!("values", Some(1), native_values),
        native!("has", Some(2), native_has),
        native!("clear", Some(1), native_clear),
        native!("get", None, native_get),
        native!("len", Some(1), native_len),
        native!("cap", Some(1), native_cap),
        native!("to_string", Some(1), native_to_string),
        native!("type", Some(1), native_type),
        native!("hash", Some(1), native_hash),
        native!("print", None, native_print),
        native!("println", None, native_println),
        native!("exit", Some(1), native_exit),
        native!("assert", None, native_assert),
        native!("has_property", Some(2), native_has_property),
        native!("get_property", Some(2), native_get_property),
        native!("set_property", Some(3), native_set_property),
        native!("del_property", Some(2), native_del_property),
        native!("sys__mem_get_bytes_allocated", Some(0), native_mem_bytes_allocated),
        native!("sys__mem_get_bytes_freed", Some(0), native_mem_bytes_freed),
        native!("sys__mem_get_net_bytes", Some(0), native_mem_net_bytes),
        native!("sys__mem_get_objects_created", Some(0), native_mem_objects_created),
        native!("sys__mem_get_live_objects", Some(0), native_mem_live_objects),
        native!("sys__mem_get_next_gc", Some(0), native_mem_next_gc),
    ]
}

fn arg_error(native: &str, message: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::new(format!("{native}: {message}"))
}

fn as_number(v: Value, native: &str) -> Result<f64, RuntimeError> {
    match v {
        Value::Int(i) => Ok(i as f64),
        Value::Number(n) => Ok(n),
        _ => Err(arg_error(native, "expected a number argument")),
    }
}

fn as_int(v: Value, native: &str) -> Result<i64, RuntimeError> {
    match v {
        Value::Int(i) => Ok(i),
        Value::Number(n) => Ok(n as i64),
        _ => Err(arg_error(native, "expected an integer argument")),
    }
}

fn as_string_id(v: Value, heap: &Heap, native: &str) -> Result<HeapId, RuntimeError> {
    match v {
        Value::Obj(id) if matches!(heap.get(id), HeapData::String(_)) => Ok(id),
        _ => Err(arg_error(native, "expected a string argument")),
    }
}

fn as_list_id(v: Value, heap: &Heap, native: &str) -> Result<HeapId, RuntimeError> {
    match v {
        Value::Obj(id) if matches!(heap.get(id), HeapData::List(_)) => Ok(id),
        _ => Err(arg_error(native, "expected a list argument")),
    }
}

fn as_map_id(v: Value, heap: &Heap, native: &str) -> Result<HeapId, RuntimeError> {
    match v {
        Value::Obj(id) if matches!(heap.get(id), HeapData::Map(_)) => Ok(id),
        _ => Err(arg_error(native, "expected a map argument")),
    }
}

fn as_instance_id(v: Value, heap: &Heap, native: &str) -> Result<HeapId, RuntimeError> {
    match v {
        Value::Obj(id) if matches!(heap.get(id), HeapData::Instance(_)) => Ok(id),
        _ => Err(arg_error(native, "expected an instance argument")),
    }
}

fn native_sqrt(args: &[Value], _heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    Ok(Value::Number(as_number(args[0], "sqrt")?.sqrt()))
}

fn native_rand(_args: &[Value], _heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    Ok(Value::Number(rand::thread_rng().r#gen::<f64>()))
}

fn native_randint(args: &[Value], _heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let lo = as_int(args[0], "randint")?;
    let hi = as_int(args[1], "randint")?;
    if lo > hi {
        return Err(arg_error("randint", "lower bound must not exceed upper bound"));
    }
    Ok(Value::Int(rand::thread_rng().gen_range(lo..=hi)))
}

fn native_list(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    Ok(Value::Obj(heap.alloc_raw(HeapData::List(args.to_vec()))))
}

fn native_append(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let id = as_list_id(args[0], heap, "append")?;
    let HeapData::List(list) = heap.get_mut(id) else { unreachable!("checked above") };
    list.push(args[1]);
    Ok(Value::Nil)
}

fn native_pop(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let id = as_list_id(args[0], heap, "pop")?;
    let HeapData::List(list) = heap.get_mut(id) else { unreachable!("checked above") };
    list.pop().ok_or_else(|| arg_error("pop", "cannot pop from an empty list"))
}

fn native_delete(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    match args[0] {
        Value::Obj(id) if matches!(heap.get(id), HeapData::List(_)) => {
            let index = as_int(args[1], "delete")?;
            let HeapData::List(list) = heap.get_mut(id) else { unreachable!("checked above") };
            let index = usize::try_from(index).map_err(|_| arg_error("delete", "index out of bounds"))?;
            if index >= list.len() {
                return Err(arg_error("delete", "index out of bounds"));
            }
            Ok(list.remove(index))
        }
        Value::Obj(id) if matches!(heap.get(id), HeapData::Map(_)) => {
            if !args[1].is_hashable(heap) {
                return Err(arg_error("delete", "key is not hashable"));
            }
            let HeapData::Map(map) = heap.get_mut(id) else { unreachable!("checked above") };
            Ok(map.shift_remove(&MapKey(args[1])).unwrap_or(Value::Nil))
        }
        _ => Err(arg_error("delete", "expected a list or map argument")),
    }
}

fn native_map(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    if args.len() % 2 != 0 {
        return Err(arg_error("map", "expected an even number of key/value arguments"));
    }
    let mut map = indexmap::IndexMap::with_hasher(ahash::RandomState::new());
    for pair in args.chunks(2) {
        if !pair[0].is_hashable(heap) {
            return Err(arg_error("map", "key is not hashable"));
        }
        map.insert(MapKey(pair[0]), pair[1]);
    }
    Ok(Value::Obj(heap.alloc_raw(HeapData::Map(map))))
}

fn native_keys(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let id = as_map_id(args[0], heap, "keys")?;
    let HeapData::Map(map) = heap.get(id) else { unreachable!("checked above") };
    let keys: Vec<Value> = map.keys().map(|k| k.0).collect();
    Ok(Value::Obj(heap.alloc_raw(HeapData::List(keys))))
}

fn native_values(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let id = as_map_id(args[0], heap, "values")?;
    let HeapData::Map(map) = heap.get(id) else { unreachable!("checked above") };
    let values: Vec<Value> = map.values().copied().collect();
    Ok(Value::Obj(heap.alloc_raw(HeapData::List(values))))
}

fn native_has(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    match args[0] {
        Value::Obj(id) if matches!(heap.get(id), HeapData::List(_)) => {
            let HeapData::List(list) = heap.get(id) else { unreachable!("checked above") };
            Ok(Value::Bool(list.iter().any(|v| v.lox_eq(args[1]))))
        }
        Value::Obj(id) if matches!(heap.get(id), HeapData::Map(_)) => {
            if !args[1].is_hashable(heap) {
                return Err(arg_error("has", "key is not hashable"));
            }
            let HeapData::Map(map) = heap.get(id) else { unreachable!("checked above") };
            Ok(Value::Bool(map.contains_key(&MapKey(args[1]))))
        }
        _ => Err(arg_error("has", "expected a list or map argument")),
    }
}

fn native_clear(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    match args[0] {
        Value::Obj(id) if matches!(heap.get(id), HeapData::List(_)) => {
            let HeapData::List(list) = heap.get_mut(id) else { unreachable!("checked above") };
            list.clear();
        }
        Value::Obj(id) if matches!(heap.get(id), HeapData::Map(_)) => {
            let HeapData::Map(map) = heap.get_mut(id) else { unreachable!("checked above") };
            map.clear();
        }
        _ => return Err(arg_error("clear", "expected a list or map argument")),
    }
    Ok(Value::Nil)
}

fn native_get(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    if args.len() < 2 || args.len() > 3 {
        return Err(arg_error("get", "expected 2 or 3 arguments"));
    }
    let id = as_map_id(args[0], heap, "get")?;
    if !args[1].is_hashable(heap) {
        return Err(arg_error("get", "key is not hashable"));
    }
    let HeapData::Map(map) = heap.get(id) else { unreachable!("checked above") };
    match map.get(&MapKey(args[1])) {
        Some(&v) => Ok(v),
        None => args.get(2).copied().ok_or_else(|| arg_error("get", "key not found")),
    }
}

fn native_len(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    match args[0] {
        Value::Obj(id) => match heap.get(id) {
            HeapData::List(l) => Ok(Value::Int(l.len() as i64)),
            HeapData::Map(m) => Ok(Value::Int(m.len() as i64)),
            HeapData::String(s) => Ok(Value::Int(s.len() as i64)),
            _ => Err(arg_error("len", "expected a list, map, or string argument")),
        },
        _ => Err(arg_error("len", "expected a list, map, or string argument")),
    }
}

fn native_cap(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let id = as_list_id(args[0], heap, "cap")?;
    let HeapData::List(list) = heap.get(id) else { unreachable!("checked above") };
    Ok(Value::Int(list.capacity() as i64))
}

fn native_to_string(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let rendered = args[0].display_string(heap);
    Ok(Value::Obj(heap.intern_string(&rendered)))
}

fn native_type(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let name = args[0].type_name(heap);
    Ok(Value::Obj(heap.intern_string(name)))
}

fn native_hash(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    if !args[0].is_hashable(heap) {
        return Err(arg_error("hash", "value is not hashable"));
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    MapKey(args[0]).hash(&mut hasher);
    Ok(Value::Int(hasher.finish() as i64))
}

fn join_args(args: &[Value], heap: &Heap) -> String {
    args.iter().map(|v| v.display_string(heap)).collect::<Vec<_>>().join(" ")
}

fn native_print(args: &[Value], heap: &mut Heap, out: &mut dyn Write) -> Result<Value, RuntimeError> {
    write!(out, "{}", join_args(args, heap)).map_err(|e| arg_error("print", e))?;
    Ok(Value::Nil)
}

fn native_println(args: &[Value], heap: &mut Heap, out: &mut dyn Write) -> Result<Value, RuntimeError> {
    writeln!(out, "{}", join_args(args, heap)).map_err(|e| arg_error("println", e))?;
    Ok(Value::Nil)
}

fn native_exit(args: &[Value], _heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let code = as_int(args[0], "exit")?;
    std::process::exit(i32::try_from(code).unwrap_or(1));
}

fn native_assert(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    if args.is_empty() {
        return Err(arg_error("assert", "expected at least 1 argument"));
    }
    if !args[0].is_truthy() {
        let message = args.get(1).map_or_else(|| "assertion failed".to_string(), |v| v.display_string(heap));
        return Err(RuntimeError::new(message));
    }
    Ok(Value::Nil)
}

fn native_has_property(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let instance_id = as_instance_id(args[0], heap, "has_property")?;
    let name_id = as_string_id(args[1], heap, "has_property")?;
    let HeapData::Instance(instance) = heap.get(instance_id) else { unreachable!("checked above") };
    Ok(Value::Bool(instance.fields.contains_key(&name_id)))
}

fn native_get_property(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let instance_id = as_instance_id(args[0], heap, "get_property")?;
    let name_id = as_string_id(args[1], heap, "get_property")?;
    let HeapData::Instance(instance) = heap.get(instance_id) else { unreachable!("checked above") };
    instance.fields.get(&name_id).copied().ok_or_else(|| {
        arg_error("get_property", format!("undefined property '{}'", heap.get_string(name_id)))
    })
}

fn native_set_property(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let instance_id = as_instance_id(args[0], heap, "set_property")?;
    let name_id = as_string_id(args[1], heap, "set_property")?;
    let HeapData::Instance(instance) = heap.get_mut(instance_id) else { unreachable!("checked above") };
    instance.fields.insert(name_id, args[2]);
    Ok(args[2])
}

fn native_del_property(args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    let instance_id = as_instance_id(args[0], heap, "del_property")?;
    let name_id = as_string_id(args[1], heap, "del_property")?;
    let HeapData::Instance(instance) = heap.get_mut(instance_id) else { unreachable!("checked above") };
    Ok(instance.fields.remove(&name_id).unwrap_or(Value::Nil))
}

fn native_mem_bytes_allocated(
    _args: &[Value],
    heap: &mut Heap,
    _out: &mut dyn Write,
) -> Result<Value, RuntimeError> {
    Ok(Value::Int(heap.stats().bytes_allocated as i64))
}

fn native_mem_bytes_freed(_args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    Ok(Value::Int(heap.stats().bytes_freed as i64))
}

fn native_mem_net_bytes(_args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    Ok(Value::Int(heap.stats().net_bytes() as i64))
}

fn native_mem_objects_created(
    _args: &[Value],
    heap: &mut Heap,
    _out: &mut dyn Write,
) -> Result<Value, RuntimeError> {
    Ok(Value::Int(heap.stats().objects_created as i64))
}

fn native_mem_live_objects(
    _args: &[Value],
    heap: &mut Heap,
    _out: &mut dyn Write,
) -> Result<Value, RuntimeError> {
    Ok(Value::Int(heap.live_object_count() as i64))
}

fn native_mem_next_gc(_args: &[Value], heap: &mut Heap, _out: &mut dyn Write) -> Result<Value, RuntimeError> {
    Ok(Value::Int(heap.stats().next_gc as i64))
}
