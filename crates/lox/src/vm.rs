//! The bytecode interpreter: a stack machine with call frames, upvalues, and
//! a mark–sweep collector it drives itself. `Vm` owns the [`Heap`] and
//! decides when a collection runs; the heap only knows how to walk and free
//! what it's given.

use std::io::Write;

use ahash::AHashMap;

use crate::error::{LoxError, RuntimeError, StackFrame};
use crate::heap::{
    BoundMethodObj, ClassObj, ClosureObj, GcConfig, Heap, HeapData, HeapId, HeapStats, InstanceObj,
    MapKey, NativeFunctionObj, UpvalueObj,
};
use crate::natives;
use crate::op::Opcode;
use crate::tracer::{NoopTracer, VmTracer};
use crate::value::Value;

const FRAMES_MAX: usize = 256;

struct GlobalSlot {
    value: Value,
    is_const: bool,
}

struct CallFrame {
    closure: HeapId,
    ip: usize,
    slot_base: usize,
}

/// The Lox interpreter, generic over a [`VmTracer`] so a release build pays
/// nothing for trace hooks (see `tracer.rs`).
pub struct Vm<T: VmTracer = NoopTracer> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<HeapId, GlobalSlot>,
    open_upvalues: Vec<HeapId>,
    tracer: T,
}

impl Vm<NoopTracer> {
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        Self::with_tracer(config, NoopTracer)
    }
}

impl<T: VmTracer> Vm<T> {
    #[must_use]
    pub fn with_tracer(config: GcConfig, tracer: T) -> Self {
        let mut heap = Heap::new(config);
        let mut globals = AHashMap::new();
        for def in natives::registry() {
            let name_id = heap.intern_string(def.name);
            let native_id = heap.alloc_raw(HeapData::NativeFunction(NativeFunctionObj {
                name: def.name,
                arity: def.arity,
                func: def.func,
            }));
            globals.insert(name_id, GlobalSlot { value: Value::Obj(native_id), is_const: true });
        }
        Self { heap, stack: Vec::new(), frames: Vec::new(), globals, open_upvalues: Vec::new(), tracer }
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Compiles `source` against this VM's heap, so literals and function
    /// bodies are interned in the same arena that will later execute them.
    pub fn compile(&mut self, source: &str) -> Result<HeapId, LoxError> {
        crate::compiler::compile(source, &mut self.heap).map_err(LoxError::from)
    }

    /// Runs a compiled script to completion, writing `echo`/`print`/`println`
    /// output to `out`. Resets the stack and call-frame state from any
    /// previous run.
    pub fn interpret(&mut self, function: HeapId, out: &mut dyn Write) -> Result<(), LoxError> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        let closure_id = self.heap.alloc_raw(HeapData::Closure(ClosureObj { function, upvalues: Vec::new() }));
        self.stack.push(Value::Obj(closure_id));
        self.frames.push(CallFrame { closure: closure_id, ip: 0, slot_base: 0 });
        self.run(out).map_err(LoxError::from)
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<(), RuntimeError> {
        loop {
            let ip = self.frames.last().expect("frame stack never empty while running").ip;
            let opcode = Opcode::from_byte(self.read_byte());
            self.tracer.before_instruction(ip, opcode, self.stack.len());
            match opcode {
                Opcode::Constant => {
                    let idx = self.read_byte() as usize;
                    let value = self.read_constant(idx);
                    self.stack.push(value);
                }
                Opcode::ConstantLong => {
                    let idx = self.read_u24_as_usize();
                    let value = self.read_constant(idx);
                    self.stack.push(value);
                }
                Opcode::Nil => self.stack.push(Value::Nil),
                Opcode::True => self.stack.push(Value::Bool(true)),
                Opcode::False => self.stack.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => self.stack.push(self.peek(0)),

                Opcode::DefineGlobal | Opcode::DefineGlobalConst => {
                    let idx = self.read_byte() as usize;
                    let name_id = self.read_constant(idx).as_obj().expect("global name constant must be a string");
                    let value = self.pop();
                    let is_const = opcode == Opcode::DefineGlobalConst;
                    self.globals.insert(name_id, GlobalSlot { value, is_const });
                }
                Opcode::GetGlobal => {
                    let idx = self.read_byte() as usize;
                    let name_id = self.read_constant(idx).as_obj().expect("global name constant must be a string");
                    match self.globals.get(&name_id) {
                        Some(slot) => self.stack.push(slot.value),
                        None => {
                            let name = self.heap.get_string(name_id).to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                        }
                    }
                }
                Opcode::SetGlobal => {
                    let idx = self.read_byte() as usize;
                    let name_id = self.read_constant(idx).as_obj().expect("global name constant must be a string");
                    let value = self.peek(0);
                    match self.globals.get_mut(&name_id) {
                        Some(slot) if slot.is_const => {
                            let name = self.heap.get_string(name_id).to_string();
                            return Err(self.runtime_error(format!("Cannot assign to const variable '{name}'.")));
                        }
                        Some(slot) => slot.value = value,
                        None => {
                            let name = self.heap.get_string(name_id).to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                        }
                    }
                }

                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let slot_base = self.frames.last().expect("frame").slot_base;
                    self.stack.push(self.stack[slot_base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let slot_base = self.frames.last().expect("frame").slot_base;
                    self.stack[slot_base + slot] = self.peek(0);
                }

                Opcode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let upvalue_id = self.current_upvalue(idx);
                    let value = match self.heap.get(upvalue_id) {
                        HeapData::Upvalue(UpvalueObj::Open(stack_idx)) => self.stack[*stack_idx],
                        HeapData::Upvalue(UpvalueObj::Closed(v)) => *v,
                        _ => unreachable!("upvalue slot must hold an Upvalue object"),
                    };
                    self.stack.push(value);
                }
                Opcode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let upvalue_id = self.current_upvalue(idx);
                    let value = self.peek(0);
                    match self.heap.get_mut(upvalue_id) {
                        HeapData::Upvalue(UpvalueObj::Open(stack_idx)) => {
                            let i = *stack_idx;
                            self.stack[i] = value;
                        }
                        HeapData::Upvalue(UpvalueObj::Closed(v)) => *v = value,
                        _ => unreachable!("upvalue slot must hold an Upvalue object"),
                    }
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.stack.pop();
                }

                Opcode::GetProperty => self.op_get_property()?,
                Opcode::SetProperty => self.op_set_property()?,
                Opcode::GetSuper => self.op_get_super()?,
                Opcode::Invoke => {
                    let name_idx = self.read_byte() as usize;
                    let argc = self.read_byte();
                    let name_id = self.read_constant(name_idx).as_obj().expect("invoke name must be a string");
                    self.invoke(name_id, argc, out)?;
                }
                Opcode::SuperInvoke => {
                    let name_idx = self.read_byte() as usize;
                    let argc = self.read_byte();
                    let name_id = self.read_constant(name_idx).as_obj().expect("invoke name must be a string");
                    let superclass_id = self.pop().as_obj().expect("super must resolve to a class");
                    self.invoke_from_class(superclass_id, name_id, argc, out)?;
                }

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a.lox_eq(b)));
                }
                Opcode::Greater => self.numeric_compare(|a, b| a > b)?,
                Opcode::Less => self.numeric_compare(|a, b| a < b)?,
                Opcode::Add => self.op_add()?,
                Opcode::Subtract => self.int_or_num_binary(i64::wrapping_sub, |a, b| a - b)?,
                Opcode::Multiply => self.int_or_num_binary(i64::wrapping_mul, |a, b| a * b)?,
                Opcode::Divide => self.op_divide()?,
                Opcode::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }
                Opcode::Negate => {
                    let value = self.pop();
                    let result = match value {
                        Value::Int(i) => Value::Int(-i),
                        Value::Number(n) => Value::Number(-n),
                        _ => return Err(self.runtime_error("Operand must be a number.")),
                    };
                    self.stack.push(result);
                }
                Opcode::Print => {
                    let value = self.pop();
                    let rendered = value.display_string(&self.heap);
                    writeln!(out, "{rendered}").map_err(|e| self.runtime_error(e.to_string()))?;
                }

                Opcode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().expect("frame").ip += offset as usize;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("frame").ip += offset as usize;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().expect("frame").ip -= offset as usize;
                }

                Opcode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc, out)?;
                }
                Opcode::Closure => self.op_closure(),
                Opcode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame stack never empty while running");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.stack.push(result);
                }

                Opcode::Class => {
                    let idx = self.read_byte() as usize;
                    let name_id = self.read_constant(idx).as_obj().expect("class name must be a string");
                    let class_id = self.alloc(HeapData::Class(ClassObj {
                        name: name_id,
                        methods: AHashMap::new(),
                        superclass: None,
                        init: None,
                    }));
                    self.stack.push(Value::Obj(class_id));
                }
                Opcode::Inherit => self.op_inherit()?,
                Opcode::Method => self.op_method(),

                Opcode::BuildList => {
                    let n = self.read_byte() as usize;
                    let start = self.stack.len() - n;
                    let items = self.stack[start..].to_vec();
                    let list_id = self.alloc(HeapData::List(items));
                    self.stack.truncate(start);
                    self.stack.push(Value::Obj(list_id));
                }
                Opcode::BuildMap => self.op_build_map()?,
                Opcode::IndexGet => {
                    let index = self.peek(0);
                    let target = self.peek(1);
                    let result = self.index_get(target, index)?;
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(result);
                }
                Opcode::IndexSet => {
                    let value = self.peek(0);
                    let index = self.peek(1);
                    let target = self.peek(2);
                    self.index_set(target, index, value)?;
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.pop();
                    self.stack.push(value);
                }
            }
        }
    }

    // ---- bytecode stream helpers -------------------------------------------------

    fn current_frame_closure(&self) -> HeapId {
        self.frames.last().expect("frame stack never empty while running").closure
    }

    fn current_function_id(&self) -> HeapId {
        match self.heap.get(self.current_frame_closure()) {
            HeapData::Closure(c) => c.function,
            _ => unreachable!("call frame must point at a Closure object"),
        }
    }

    fn current_upvalue(&self, idx: usize) -> HeapId {
        match self.heap.get(self.current_frame_closure()) {
            HeapData::Closure(c) => c.upvalues[idx],
            _ => unreachable!("call frame must point at a Closure object"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let function_id = self.current_function_id();
        let frame = self.frames.last_mut().expect("frame stack never empty while running");
        let ip = frame.ip;
        frame.ip += 1;
        match self.heap.get(function_id) {
            HeapData::Function(f) => f.chunk.code[ip],
            _ => unreachable!("closure must point at a Function object"),
        }
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        u16::from_le_bytes([lo, hi])
    }

    fn read_u24_as_usize(&mut self) -> usize {
        let b0 = self.read_byte();
        let b1 = self.read_byte();
        let b2 = self.read_byte();
        u32::from_le_bytes([b0, b1, b2, 0]) as usize
    }

    fn read_constant(&self, idx: usize) -> Value {
        match self.heap.get(self.current_function_id()) {
            HeapData::Function(f) => f.chunk.constants[idx],
            _ => unreachable!("closure must point at a Function object"),
        }
    }

    // ---- stack helpers -------------------------------------------------

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler-guaranteed stack discipline")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- allocation -------------------------------------------------

    fn alloc(&mut self, data: HeapData) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc_raw(data)
    }

    fn intern(&mut self, s: &str) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern_string(s)
    }

    fn collect_garbage(&mut self) {
        let before_stats = self.heap.stats();
        let before_live = self.heap.live_object_count();
        let mut roots = Vec::new();
        for &value in &self.stack {
            if let Some(id) = value.as_obj() {
                roots.push(id);
            }
        }
        for frame in &self.frames {
            roots.push(frame.closure);
        }
        for (&name_id, slot) in &self.globals {
            roots.push(name_id);
            if let Some(id) = slot.value.as_obj() {
                roots.push(id);
            }
        }
        roots.extend(self.open_upvalues.iter().copied());
        self.heap.collect_garbage(roots);
        let after_stats = self.heap.stats();
        let after_live = self.heap.live_object_count();
        self.tracer.on_gc(
            after_stats.bytes_freed.saturating_sub(before_stats.bytes_freed),
            before_live.saturating_sub(after_live),
        );
    }

    // ---- upvalues -------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> HeapId {
        for &id in &self.open_upvalues {
            if let HeapData::Upvalue(UpvalueObj::Open(idx)) = self.heap.get(id) {
                if *idx == stack_index {
                    return id;
                }
            }
        }
        let id = self.alloc(HeapData::Upvalue(UpvalueObj::Open(stack_index)));
        self.open_upvalues.push(id);
        id
    }

    fn close_upvalues(&mut self, from: usize) {
        let mut still_open = Vec::with_capacity(self.open_upvalues.len());
        for id in self.open_upvalues.drain(..) {
            let stack_idx = match self.heap.get(id) {
                HeapData::Upvalue(UpvalueObj::Open(idx)) => Some(*idx),
                _ => None,
            };
            match stack_idx {
                Some(idx) if idx >= from => {
                    let value = self.stack[idx];
                    if let HeapData::Upvalue(u) = self.heap.get_mut(id) {
                        *u = UpvalueObj::Closed(value);
                    }
                }
                Some(_) => still_open.push(id),
                None => {}
            }
        }
        self.open_upvalues = still_open;
    }

    fn op_closure(&mut self) {
        let const_idx = self.read_byte() as usize;
        let function_id = self.read_constant(const_idx).as_obj().expect("closure constant must be a function");
        let upvalue_count = match self.heap.get(function_id) {
            HeapData::Function(f) => f.upvalue_count,
            _ => unreachable!("closure constant must be a function"),
        };
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        let slot_base = self.frames.last().expect("frame").slot_base;
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue_id = if is_local { self.capture_upvalue(slot_base + index) } else { self.current_upvalue(index) };
            upvalues.push(upvalue_id);
        }
        let closure_id = self.alloc(HeapData::Closure(ClosureObj { function: function_id, upvalues }));
        self.stack.push(Value::Obj(closure_id));
    }

    // ---- calls -------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8, out: &mut dyn Write) -> Result<(), RuntimeError> {
        let Value::Obj(id) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        enum Kind {
            Closure,
            Native,
            Class,
            Bound,
        }
        let kind = match self.heap.get(id) {
            HeapData::Closure(_) => Kind::Closure,
            HeapData::NativeFunction(_) => Kind::Native,
            HeapData::Class(_) => Kind::Class,
            HeapData::BoundMethod(_) => Kind::Bound,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match kind {
            Kind::Closure => self.call_closure(id, argc),
            Kind::Native => self.call_native(id, argc, out),
            Kind::Class => self.call_class(id, argc, out),
            Kind::Bound => self.call_bound_method(id, argc, out),
        }
    }

    fn call_closure(&mut self, closure_id: HeapId, argc: u8) -> Result<(), RuntimeError> {
        let function_id = match self.heap.get(closure_id) {
            HeapData::Closure(c) => c.function,
            _ => unreachable!("expected a Closure object"),
        };
        let arity = match self.heap.get(function_id) {
            HeapData::Function(f) => f.arity,
            _ => unreachable!("closure must point at a Function object"),
        };
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let callee_name = match self.heap.get(function_id) {
            HeapData::Function(f) => f.display_name(&self.heap).to_string(),
            _ => unreachable!("closure must point at a Function object"),
        };
        self.tracer.on_call(&callee_name, argc as usize);
        let slot_base = self.stack.len() - 1 - argc as usize;
        self.frames.push(CallFrame { closure: closure_id, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_id: HeapId, argc: u8, out: &mut dyn Write) -> Result<(), RuntimeError> {
        let (expected, func) = match self.heap.get(native_id) {
            HeapData::NativeFunction(n) => (n.arity, n.func),
            _ => unreachable!("expected a NativeFunction object"),
        };
        if let Some(expected) = expected {
            if argc != expected {
                return Err(self.runtime_error(format!("Expected {expected} arguments but got {argc}.")));
            }
        }
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        let args_start = self.stack.len() - argc as usize;
        let result = func(&self.stack[args_start..], &mut self.heap, out)?;
        self.stack.truncate(args_start - 1);
        self.stack.push(result);
        Ok(())
    }

    fn call_class(&mut self, class_id: HeapId, argc: u8, out: &mut dyn Write) -> Result<(), RuntimeError> {
        let init = match self.heap.get(class_id) {
            HeapData::Class(c) => c.init,
            _ => unreachable!("expected a Class object"),
        };
        let slot = self.stack.len() - 1 - argc as usize;
        let instance_id = self.alloc(HeapData::Instance(InstanceObj { class: class_id, fields: AHashMap::new() }));
        self.stack[slot] = Value::Obj(instance_id);
        match init {
            Some(init_id) => self.call_closure(init_id, argc),
            None if argc == 0 => Ok(()),
            None => {
                let _ = out;
                Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
            }
        }
    }

    fn call_bound_method(&mut self, bound_id: HeapId, argc: u8, _out: &mut dyn Write) -> Result<(), RuntimeError> {
        let (receiver, method_id) = match self.heap.get(bound_id) {
            HeapData::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!("expected a BoundMethod object"),
        };
        let slot = self.stack.len() - 1 - argc as usize;
        self.stack[slot] = receiver;
        self.call_closure(method_id, argc)
    }

    fn invoke(&mut self, name_id: HeapId, argc: u8, out: &mut dyn Write) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(instance_id) = receiver else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let (field_value, class_id) = match self.heap.get(instance_id) {
            HeapData::Instance(instance) => (instance.fields.get(&name_id).copied(), instance.class),
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        if let Some(field_value) = field_value {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = field_value;
            return self.call_value(field_value, argc, out);
        }
        self.invoke_from_class(class_id, name_id, argc, out)
    }

    fn invoke_from_class(
        &mut self,
        class_id: HeapId,
        name_id: HeapId,
        argc: u8,
        _out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        let method_id = match self.heap.get(class_id) {
            HeapData::Class(c) => c.methods.get(&name_id).copied(),
            _ => unreachable!("expected a Class object"),
        };
        match method_id {
            Some(method_id) => self.call_closure(method_id, argc),
            None => {
                let name = self.heap.get_string(name_id).to_string();
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    // ---- classes and properties -------------------------------------------------

    fn op_inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_val = self.peek(1);
        let subclass_val = self.peek(0);
        let Value::Obj(super_id) = superclass_val else {
            return Err(self.runtime_error("Superclass must be a class."));
        };
        let (methods, init) = match self.heap.get(super_id) {
            HeapData::Class(c) => (c.methods.clone(), c.init),
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let sub_id = subclass_val.as_obj().expect("Inherit always follows a Class opcode");
        if let HeapData::Class(sub) = self.heap.get_mut(sub_id) {
            sub.methods.extend(methods);
            sub.init = init;
            sub.superclass = Some(super_id);
        }
        self.stack.pop();
        Ok(())
    }

    fn op_method(&mut self) {
        let name_idx = self.read_byte() as usize;
        let name_id = self.read_constant(name_idx).as_obj().expect("method name must be a string");
        let is_init = self.heap.get_string(name_id) == "init";
        let method_id = self.pop().as_obj().expect("Method always follows a Closure push");
        let class_id = self.peek(0).as_obj().expect("Method compiled only inside a class body");
        if let HeapData::Class(class) = self.heap.get_mut(class_id) {
            class.methods.insert(name_id, method_id);
            if is_init {
                class.init = Some(method_id);
            }
        }
    }

    fn op_get_property(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let name_id = self.read_constant(name_idx).as_obj().expect("property name must be a string");
        let receiver = self.peek(0);
        let Value::Obj(instance_id) = receiver else {
            return Err(self.runtime_error("Only instances have properties."));
        };
        let (field_value, class_id) = match self.heap.get(instance_id) {
            HeapData::Instance(instance) => (instance.fields.get(&name_id).copied(), instance.class),
            _ => return Err(self.runtime_error("Only instances have properties.")),
        };
        if let Some(value) = field_value {
            self.stack.pop();
            self.stack.push(value);
            return Ok(());
        }
        let method_id = match self.heap.get(class_id) {
            HeapData::Class(c) => c.methods.get(&name_id).copied(),
            _ => unreachable!("expected a Class object"),
        };
        match method_id {
            Some(method_id) => {
                let bound_id = self.alloc(HeapData::BoundMethod(BoundMethodObj { receiver, method: method_id }));
                self.stack.pop();
                self.stack.push(Value::Obj(bound_id));
                Ok(())
            }
            None => {
                let name = self.heap.get_string(name_id).to_string();
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    fn op_set_property(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let name_id = self.read_constant(name_idx).as_obj().expect("property name must be a string");
        let value = self.peek(0);
        let receiver = self.peek(1);
        let Value::Obj(instance_id) = receiver else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        match self.heap.get_mut(instance_id) {
            HeapData::Instance(instance) => {
                instance.fields.insert(name_id, value);
            }
            _ => return Err(self.runtime_error("Only instances have fields.")),
        }
        self.stack.pop();
        self.stack.pop();
        self.stack.push(value);
        Ok(())
    }

    fn op_get_super(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let name_id = self.read_constant(name_idx).as_obj().expect("super property name must be a string");
        let superclass_val = self.peek(0);
        let this_val = self.peek(1);
        let superclass_id = superclass_val.as_obj().expect("super must resolve to a class");
        let method_id = match self.heap.get(superclass_id) {
            HeapData::Class(c) => c.methods.get(&name_id).copied(),
            _ => None,
        };
        let Some(method_id) = method_id else {
            let name = self.heap.get_string(name_id).to_string();
            return Err(self.runtime_error(format!("Undefined property '{name}'.")));
        };
        let bound_id = self.alloc(HeapData::BoundMethod(BoundMethodObj { receiver: this_val, method: method_id }));
        self.stack.pop();
        self.stack.pop();
        self.stack.push(Value::Obj(bound_id));
        Ok(())
    }

    // ---- arithmetic -------------------------------------------------

    fn num_of(v: Value) -> f64 {
        match v {
            Value::Int(i) => i as f64,
            Value::Number(n) => n,
            _ => unreachable!("num_of called on a non-numeric value"),
        }
    }

    fn numeric_compare(&mut self, cmp: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (an, bn) = match (a, b) {
            (Value::Int(_) | Value::Number(_), Value::Int(_) | Value::Number(_)) => (Self::num_of(a), Self::num_of(b)),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.stack.push(Value::Bool(cmp(an, bn)));
        Ok(())
    }

    fn int_or_num_binary(
        &mut self,
        int_op: impl Fn(i64, i64) -> i64,
        num_op: impl Fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(int_op(x, y)),
            (Value::Int(_) | Value::Number(_), Value::Int(_) | Value::Number(_)) => {
                Value::Number(num_op(Self::num_of(a), Self::num_of(b)))
            }
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.stack.push(result);
        Ok(())
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(y)),
            (Value::Int(_) | Value::Number(_), Value::Int(_) | Value::Number(_)) => {
                Value::Number(Self::num_of(a) + Self::num_of(b))
            }
            (Value::Obj(ia), Value::Obj(ib))
                if matches!(self.heap.get(ia), HeapData::String(_)) && matches!(self.heap.get(ib), HeapData::String(_)) =>
            {
                let mut concatenated = self.heap.get_string(ia).to_string();
                concatenated.push_str(self.heap.get_string(ib));
                Value::Obj(self.intern(&concatenated))
            }
            _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
        };
        self.stack.pop();
        self.stack.pop();
        self.stack.push(result);
        Ok(())
    }

    fn op_divide(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        // Only an all-int division by zero is an error; a double divisor of
        // zero yields IEEE infinity/NaN like any other double division.
        if matches!(a, Value::Int(_)) && matches!(b, Value::Int(0)) {
            return Err(self.runtime_error("Division by zero."));
        }
        let result = match (a, b) {
            (Value::Int(_) | Value::Number(_), Value::Int(_) | Value::Number(_)) => {
                Value::Number(Self::num_of(a) / Self::num_of(b))
            }
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.stack.push(result);
        Ok(())
    }

    // ---- lists and maps -------------------------------------------------

    fn op_build_map(&mut self) -> Result<(), RuntimeError> {
        let n = self.read_byte() as usize;
        let start = self.stack.len() - n * 2;
        for i in 0..n {
            if !self.stack[start + i * 2].is_hashable(&self.heap) {
                return Err(self.runtime_error("Map keys must be hashable."));
            }
        }
        let mut map = indexmap::IndexMap::with_hasher(ahash::RandomState::new());
        for i in 0..n {
            map.insert(MapKey(self.stack[start + i * 2]), self.stack[start + i * 2 + 1]);
        }
        let map_id = self.alloc(HeapData::Map(map));
        self.stack.truncate(start);
        self.stack.push(Value::Obj(map_id));
        Ok(())
    }

    fn list_index(&self, index: Value, len: usize) -> Result<usize, RuntimeError> {
        let i = match index {
            Value::Int(i) => i,
            Value::Number(n) => n as i64,
            _ => return Err(self.runtime_error("List index must be a number.")),
        };
        let i = if i < 0 { i + len as i64 } else { i };
        usize::try_from(i).ok().filter(|&i| i < len).ok_or_else(|| self.runtime_error("Index out of bounds."))
    }

    fn index_get(&self, target: Value, index: Value) -> Result<Value, RuntimeError> {
        let Value::Obj(id) = target else {
            return Err(self.runtime_error("Only lists and maps support indexing."));
        };
        match self.heap.get(id) {
            HeapData::List(list) => {
                let i = self.list_index(index, list.len())?;
                Ok(list[i])
            }
            HeapData::Map(map) => {
                if !index.is_hashable(&self.heap) {
                    return Err(self.runtime_error("Map keys must be hashable."));
                }
                map.get(&MapKey(index)).copied().ok_or_else(|| self.runtime_error("Key not found."))
            }
            _ => Err(self.runtime_error("Only lists and maps support indexing.")),
        }
    }

    fn index_set(&mut self, target: Value, index: Value, value: Value) -> Result<(), RuntimeError> {
        let Value::Obj(id) = target else {
            return Err(self.runtime_error("Only lists and maps support indexing."));
        };
        let is_list = matches!(self.heap.get(id), HeapData::List(_));
        let is_map = matches!(self.heap.get(id), HeapData::Map(_));
        if is_list {
            let len = match self.heap.get(id) {
                HeapData::List(l) => l.len(),
                _ => unreachable!("checked above"),
            };
            let i = self.list_index(index, len)?;
            if let HeapData::List(list) = self.heap.get_mut(id) {
                list[i] = value;
            }
            Ok(())
        } else if is_map {
            if !index.is_hashable(&self.heap) {
                return Err(self.runtime_error("Map keys must be hashable."));
            }
            if let HeapData::Map(map) = self.heap.get_mut(id) {
                map.insert(MapKey(index), value);
            }
            Ok(())
        } else {
            Err(self.runtime_error("Only lists and maps support indexing."))
        }
    }

    // ---- errors -------------------------------------------------

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let HeapData::Closure(c) = self.heap.get(frame.closure) else { continue };
            let HeapData::Function(f) = self.heap.get(c.function) else { continue };
            let line = f.chunk.line_for(frame.ip.saturating_sub(1));
            let display_name = f.display_name(&self.heap);
            let function_name = if display_name == "<script>" { display_name.to_string() } else { format!("{display_name}()") };
            trace.push(StackFrame { function_name, line });
        }
        RuntimeError { message: message.into(), trace }
    }
}
