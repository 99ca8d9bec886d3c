/// Expression descriptors and operator tables.
use warden_core::string::LuaStr;

/// Where an expression's value currently lives.
#[derive(Clone, Debug)]
pub enum ExprDesc {
    /// No value (empty expression list position).
    Void,
    Nil,
    True,
    False,
    Int(i32),
    Num(f64),
    Str(LuaStr),
    /// Value sits in a register (a local or a discharged temporary).
    Register(u32),
    /// Upvalue at the given index.
    Upvalue(u32),
    /// Global: `_ENV[name]` through the environment upvalue.
    Global(LuaStr),
    /// Indexed access: table register + RK key.
    Indexed { table: u32, key: RkOperand },
    /// Function call whose result count is still patchable; pc of the CALL.
    Call(usize),
    /// `...` expression; pc of the VARARG.
    Vararg(usize),
}

/// A register-or-constant operand.
#[derive(Clone, Copy, Debug)]
pub enum RkOperand {
    Register(u32),
    Constant(u32),
}

impl RkOperand {
    /// Encode for the instruction field.
    pub fn encode(self) -> u32 {
        match self {
            RkOperand::Register(r) => r,
            RkOperand::Constant(k) => warden_core::opcode::rk_const(k),
        }
    }
}

impl ExprDesc {
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            ExprDesc::Nil
                | ExprDesc::True
                | ExprDesc::False
                | ExprDesc::Int(_)
                | ExprDesc::Num(_)
                | ExprDesc::Str(_)
        )
    }

    /// True for expressions that can produce multiple values.
    pub fn is_multret(&self) -> bool {
        matches!(self, ExprDesc::Call(_) | ExprDesc::Vararg(_))
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

impl BinOp {
    /// (left, right) binding priorities; right < left makes an operator
    /// right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq | BinOp::NotEq | BinOp::Eq => (3, 3),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
        )
    }
}

/// Binding priority of unary operators.
pub const UNARY_PRIORITY: u8 = 12;
