/// Function prototype: compiled bytecode, constants and debug info.
///
/// Prototypes are produced by the compiler, consumed read-only by the VM, and
/// form an immutable forest rooted at the loaded chunk.
use crate::opcode::Instruction;
use crate::string::LuaStr;
use crate::value::Value;
use std::sync::Arc;

/// A constant-pool entry.
#[derive(Clone, Debug)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    Str(LuaStr),
}

impl Constant {
    /// Runtime view of the constant.
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Nil => Value::Nil,
            Constant::Boolean(b) => Value::Boolean(*b),
            Constant::Integer(i) => Value::Integer(*i),
            Constant::Number(f) => Value::Number(*f),
            Constant::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// Upvalue descriptor: where a CLOSURE instruction captures each cell from.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    /// Name for debug info.
    pub name: Option<LuaStr>,
    /// True when captured from the enclosing function's register stack,
    /// false when forwarded from the enclosing function's upvalues.
    pub in_stack: bool,
    pub index: u8,
}

/// Local-variable debug entry.
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: LuaStr,
    /// First pc where the variable is active.
    pub start_pc: u32,
    /// First pc where the variable is dead.
    pub end_pc: u32,
}

/// A compiled function.
#[derive(Clone, Debug)]
pub struct Prototype {
    /// Chunk name for error messages.
    pub source: LuaStr,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Arc<Prototype>>,
    pub upvalues: Vec<UpvalDesc>,
    pub locals: Vec<LocalVar>,
    /// Source line per pc, parallel to `code`.
    pub line_info: Vec<u32>,
}

impl Prototype {
    pub fn new(source: LuaStr) -> Self {
        Prototype {
            source,
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2, // minimum frame
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            line_info: Vec::new(),
        }
    }

    /// Append an instruction, recording its source line. Returns the pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        self.line_info.push(line);
        pc
    }

    /// Add a constant, deduplicating. Returns its index.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i;
            }
        }
        let idx = self.constants.len();
        self.constants.push(k);
        idx
    }

    /// Source line for a pc, 0 when unknown.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }

    /// `source:line` position prefix for error messages.
    pub fn position(&self, pc: usize) -> String {
        format!("{}:{}", self.source, self.line_at(pc))
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Mutable instruction access for backpatching.
    pub fn get_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.code[pc]
    }
}

/// Constant-pool equality: float NaN compares by bit pattern so the pool
/// still deduplicates.
fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
        (Constant::Integer(a), Constant::Integer(b)) => a == b,
        (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
        (Constant::Str(a), Constant::Str(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    fn proto() -> Prototype {
        Prototype::new(LuaStr::from("test"))
    }

    #[test]
    fn test_empty_proto() {
        let p = proto();
        assert_eq!(p.code_len(), 0);
        assert!(p.constants.is_empty());
        assert_eq!(p.max_stack_size, 2);
        assert!(!p.is_vararg);
    }

    #[test]
    fn test_emit_records_line() {
        let mut p = proto();
        let pc = p.emit(Instruction::abc(OpCode::Move, 0, 1, 0), 3);
        assert_eq!(pc, 0);
        assert_eq!(p.line_at(0), 3);
        assert_eq!(p.line_at(99), 0);
    }

    #[test]
    fn test_constant_dedup() {
        let mut p = proto();
        assert_eq!(
            p.add_constant(Constant::Integer(42)),
            p.add_constant(Constant::Integer(42))
        );
        assert_ne!(
            p.add_constant(Constant::Integer(42)),
            p.add_constant(Constant::Integer(43))
        );
        assert_eq!(
            p.add_constant(Constant::Str(LuaStr::from("x"))),
            p.add_constant(Constant::Str(LuaStr::from("x")))
        );
    }

    #[test]
    fn test_int_and_float_constants_distinct() {
        let mut p = proto();
        let i = p.add_constant(Constant::Integer(1));
        let f = p.add_constant(Constant::Number(1.0));
        assert_ne!(i, f);
    }

    #[test]
    fn test_position_format() {
        let mut p = proto();
        p.emit(Instruction::abc(OpCode::Return, 0, 1, 0), 7);
        assert_eq!(p.position(0), "test:7");
    }

    #[test]
    fn test_backpatch() {
        let mut p = proto();
        p.emit(Instruction::asbx(OpCode::Jmp, 0, 0), 1);
        p.get_mut(0).set_sbx(42);
        assert_eq!(p.code[0].sbx(), 42);
    }
}
