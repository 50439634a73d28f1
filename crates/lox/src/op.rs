/// The bytecode instruction set. Operands immediately follow the opcode byte
/// in the chunk and are decoded by the VM dispatch loop; their widths are
/// documented per-variant since the byte stream itself carries no tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum Opcode {
    /// `idx: u8` — push `constants[idx]`.
    Constant,
    /// `idx: u24` — push `constants[idx]` for pools larger than 256 entries.
    ConstantLong,
    Nil,
    True,
    False,
    Pop,
    Dup,
    /// `idx: u8` into the constant pool, naming the global.
    DefineGlobal,
    DefineGlobalConst,
    GetGlobal,
    SetGlobal,
    /// `slot: u8`
    GetLocal,
    SetLocal,
    /// `idx: u8`
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    /// `idx: u8` constant naming the property.
    GetProperty,
    SetProperty,
    GetSuper,
    /// `idx: u8, argc: u8`
    Invoke,
    SuperInvoke,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    /// `offset: u16` forward jump.
    Jump,
    JumpIfFalse,
    /// `offset: u16` backward jump.
    Loop,
    /// `argc: u8`
    Call,
    /// `func_idx: u8` followed by `upvalue_count` `(is_local: u8, index: u8)` pairs.
    Closure,
    Return,
    /// `name_idx: u8`
    Class,
    Inherit,
    Method,
    /// `n: u8` number of elements already pushed.
    BuildList,
    /// `n: u8` number of key/value pairs already pushed.
    BuildMap,
    IndexGet,
    IndexSet,
}

impl Opcode {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Opcode::Constant,
            1 => Opcode::ConstantLong,
            2 => Opcode::Nil,
            3 => Opcode::True,
            4 => Opcode::False,
            5 => Opcode::Pop,
            6 => Opcode::Dup,
            7 => Opcode::DefineGlobal,
            8 => Opcode::DefineGlobalConst,
            9 => Opcode::GetGlobal,
            10 => Opcode::SetGlobal,
            11 => Opcode::GetLocal,
            12 => Opcode::SetLocal,
            13 => Opcode::GetUpvalue,
            14 => Opcode::SetUpvalue,
            15 => Opcode::CloseUpvalue,
            16 => Opcode::GetProperty,
            17 => Opcode::SetProperty,
            18 => Opcode::GetSuper,
            19 => Opcode::Invoke,
            20 => Opcode::SuperInvoke,
            21 => Opcode::Equal,
            22 => Opcode::Greater,
            23 => Opcode::Less,
            24 => Opcode::Add,
            25 => Opcode::Subtract,
            26 => Opcode::Multiply,
            27 => Opcode::Divide,
            28 => Opcode::Not,
            29 => Opcode::Negate,
            30 => Opcode::Print,
            31 => Opcode::Jump,
            32 => Opcode::JumpIfFalse,
            33 => Opcode::Loop,
            34 => Opcode::Call,
            35 => Opcode::Closure,
            36 => Opcode::Return,
            37 => Opcode::Class,
            38 => Opcode::Inherit,
            39 => Opcode::Method,
            40 => Opcode::BuildList,
            41 => Opcode::BuildMap,
            42 => Opcode::IndexGet,
            43 => Opcode::IndexSet,
            other => unreachable!("unknown opcode byte {other}"),
        }
    }
}
