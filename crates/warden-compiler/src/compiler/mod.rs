/// Single-pass Lua 5.2 compiler: source → `Prototype` bytecode.
pub mod expr;
pub mod scope;

use crate::lexer::{LexError, Lexer};
use crate::token::Token;
use expr::{BinOp, ExprDesc, RkOperand, UnOp, UNARY_PRIORITY};
use scope::{LabelInfo, PendingGoto};
use std::fmt;
use std::sync::Arc;
use warden_core::opcode::{int2fb, Instruction, OpCode, FIELDS_PER_FLUSH, MAX_C, MAX_INDEX_RK};
use warden_core::proto::{Constant, LocalVar, Prototype, UpvalDesc};
use warden_core::string::LuaStr;

/// Compiler error.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

/// Upvalue bookkeeping during compilation.
#[derive(Clone, Debug)]
struct UpvalInfo {
    name: LuaStr,
    in_stack: bool,
    index: u8,
}

/// State for one function being compiled.
struct FuncState {
    proto: Prototype,
    scope: scope::ScopeManager,
    upvalues: Vec<UpvalInfo>,
}

impl FuncState {
    fn new(source: LuaStr) -> Self {
        FuncState {
            proto: Prototype::new(source),
            scope: scope::ScopeManager::new(),
            upvalues: Vec::new(),
        }
    }
}

/// The compiler: lexer plus a stack of nested function states.
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    func_stack: Vec<FuncState>,
    chunk_name: LuaStr,
}

/// Compile a source chunk into its prototype forest.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, CompileError> {
    let mut c = Compiler {
        lexer: Lexer::new(source),
        func_stack: Vec::new(),
        chunk_name: LuaStr::from(chunk_name),
    };
    let mut fs = FuncState::new(c.chunk_name.clone());
    fs.proto.is_vararg = true;
    // The chunk's single upvalue is its environment, bound by the loader.
    fs.upvalues.push(UpvalInfo {
        name: LuaStr::from("_ENV"),
        in_stack: false,
        index: 0,
    });
    fs.scope.enter_block(false);
    c.func_stack.push(fs);

    c.block()?;
    if !c.check(&Token::Eof) {
        let tok = c.current_token()?.clone();
        return Err(c.error(format!("'<eof>' expected near '{tok}'")));
    }
    let proto = c.close_function()?;
    Ok(Arc::new(proto))
}

impl<'a> Compiler<'a> {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    fn line(&self) -> u32 {
        self.lexer.line()
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError {
            message: msg.into(),
            line: self.line(),
        }
    }

    // ---- Token helpers ----

    fn current_token(&self) -> Result<&Token, CompileError> {
        self.lexer
            .current()
            .map(|st| &st.token)
            .map_err(|e| CompileError {
                message: e.message.clone(),
                line: e.line,
            })
    }

    fn check(&self, expected: &Token) -> bool {
        self.current_token().map(|t| t == expected).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        Ok(self.lexer.advance()?.token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(())
        } else {
            let found = self
                .current_token()
                .map(|t| format!("{t}"))
                .unwrap_or_else(|_| "error".into());
            Err(self.error(format!("'{expected}' expected near '{found}'")))
        }
    }

    fn expect_name(&mut self) -> Result<LuaStr, CompileError> {
        match self.current_token()?.clone() {
            Token::Name(n) => {
                self.advance()?;
                Ok(n)
            }
            other => Err(self.error(format!("<name> expected near '{other}'"))),
        }
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---- Emission helpers ----

    fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.fs_mut().proto.emit(inst, line)
    }

    fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32, line: u32) -> usize {
        self.emit(Instruction::abc(op, a, b, c), line)
    }

    fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32, line: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx), line)
    }

    fn emit_jump(&mut self, line: u32) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line)
    }

    fn current_pc(&self) -> usize {
        self.fs().proto.code_len()
    }

    fn patch_jump(&mut self, jump_pc: usize) {
        let target = self.current_pc();
        self.patch_jump_to(jump_pc, target);
    }

    fn patch_jump_to(&mut self, jump_pc: usize, target: usize) {
        let offset = target as i32 - jump_pc as i32 - 1;
        self.fs_mut().proto.get_mut(jump_pc).set_sbx(offset);
    }

    fn add_constant(&mut self, k: Constant) -> u32 {
        self.fs_mut().proto.add_constant(k) as u32
    }

    fn string_constant(&mut self, s: &LuaStr) -> u32 {
        self.add_constant(Constant::Str(s.clone()))
    }

    fn alloc_reg(&mut self) -> Result<u32, CompileError> {
        let reg = self.fs_mut().scope.alloc_reg();
        if reg > 250 {
            return Err(self.error("function or expression too complex"));
        }
        Ok(reg)
    }

    fn free_to(&mut self, level: u32) {
        self.fs_mut().scope.free_reg_to(level);
    }

    fn num_locals(&self) -> u32 {
        self.fs().scope.locals.len() as u32
    }

    // ---- Discharge ----

    /// Materialise `expr` into register `reg`.
    fn discharge_to_reg(&mut self, expr: &ExprDesc, reg: u32, line: u32) -> Result<(), CompileError> {
        match expr {
            ExprDesc::Void | ExprDesc::Nil => {
                self.emit_abc(OpCode::LoadNil, reg, 0, 0, line);
            }
            ExprDesc::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0, line);
            }
            ExprDesc::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0, line);
            }
            ExprDesc::Int(i) => {
                let k = self.add_constant(Constant::Integer(*i));
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Num(f) => {
                let k = self.add_constant(Constant::Number(*f));
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Str(s) => {
                let k = self.string_constant(&s.clone());
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Register(src) => {
                if *src != reg {
                    self.emit_abc(OpCode::Move, reg, *src, 0, line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.emit_abc(OpCode::GetUpval, reg, *idx, 0, line);
            }
            ExprDesc::Global(name) => {
                let env = self.env_upvalue()?;
                let k = self.string_constant(&name.clone());
                if k > MAX_INDEX_RK {
                    return Err(self.error("too many constants in function"));
                }
                self.emit_abc(
                    OpCode::GetTabUp,
                    reg,
                    env,
                    warden_core::opcode::rk_const(k),
                    line,
                );
            }
            ExprDesc::Indexed { table, key } => {
                self.emit_abc(OpCode::GetTable, reg, *table, key.encode(), line);
            }
            ExprDesc::Call(pc) => {
                let a = {
                    let inst = self.fs_mut().proto.get_mut(*pc);
                    inst.set_c(2);
                    inst.a()
                };
                if a != reg {
                    self.emit_abc(OpCode::Move, reg, a, 0, line);
                }
            }
            ExprDesc::Vararg(pc) => {
                let inst = self.fs_mut().proto.get_mut(*pc);
                inst.set_a(reg);
                inst.set_b(2);
            }
        }
        Ok(())
    }

    fn emit_load_constant(&mut self, reg: u32, k: u32, line: u32) {
        if k <= warden_core::opcode::MAX_BX {
            self.emit_abx(OpCode::LoadK, reg, k, line);
        } else {
            self.emit_abx(OpCode::LoadKX, reg, 0, line);
            self.emit(Instruction::ax(OpCode::ExtraArg, k), line);
        }
    }

    /// Ensure the expression lives in some register.
    fn discharge_to_any_reg(&mut self, expr: &ExprDesc, line: u32) -> Result<u32, CompileError> {
        if let ExprDesc::Register(r) = expr {
            return Ok(*r);
        }
        let reg = self.alloc_reg()?;
        self.discharge_to_reg(expr, reg, line)?;
        Ok(reg)
    }

    /// Register-or-constant operand for arithmetic/comparison/table opcodes.
    fn rk_operand(&mut self, expr: &ExprDesc, line: u32) -> Result<RkOperand, CompileError> {
        let k = match expr {
            ExprDesc::Nil => Some(self.add_constant(Constant::Nil)),
            ExprDesc::True => Some(self.add_constant(Constant::Boolean(true))),
            ExprDesc::False => Some(self.add_constant(Constant::Boolean(false))),
            ExprDesc::Int(i) => Some(self.add_constant(Constant::Integer(*i))),
            ExprDesc::Num(f) => Some(self.add_constant(Constant::Number(*f))),
            ExprDesc::Str(s) => Some(self.string_constant(&s.clone())),
            _ => None,
        };
        match k {
            Some(k) if k <= MAX_INDEX_RK => Ok(RkOperand::Constant(k)),
            _ => Ok(RkOperand::Register(self.discharge_to_any_reg(expr, line)?)),
        }
    }

    // ---- Expressions ----

    pub(crate) fn expression(&mut self) -> Result<ExprDesc, CompileError> {
        self.sub_expression(0)
    }

    fn sub_expression(&mut self, min_prec: u8) -> Result<ExprDesc, CompileError> {
        let line = self.line();
        let mut expr = if let Some(unop) = self.check_unary_op()? {
            self.advance()?;
            let sub = self.sub_expression(UNARY_PRIORITY)?;
            self.code_unary_op(unop, sub, line)?
        } else {
            self.simple_expression()?
        };

        while let Some(binop) = self.check_binary_op()? {
            let (left_prec, right_prec) = binop.priority();
            if left_prec <= min_prec {
                break;
            }
            let op_line = self.line();
            self.advance()?;

            expr = match binop {
                BinOp::And | BinOp::Or => {
                    self.code_short_circuit(binop, expr, right_prec, op_line)?
                }
                BinOp::Concat => self.code_concat(expr, op_line)?,
                _ if binop.is_comparison() => {
                    let right = self.sub_expression(right_prec)?;
                    self.code_comparison(binop, expr, right, op_line)?
                }
                _ => {
                    let right = self.sub_expression(right_prec)?;
                    self.code_arith(binop, expr, right, op_line)?
                }
            };
        }

        Ok(expr)
    }

    fn simple_expression(&mut self) -> Result<ExprDesc, CompileError> {
        let token = self.current_token()?.clone();
        match token {
            Token::Int(i) => {
                self.advance()?;
                Ok(ExprDesc::Int(i))
            }
            Token::Number(f) => {
                self.advance()?;
                Ok(ExprDesc::Num(f))
            }
            Token::Str(s) => {
                self.advance()?;
                Ok(ExprDesc::Str(s))
            }
            Token::Nil => {
                self.advance()?;
                Ok(ExprDesc::Nil)
            }
            Token::True => {
                self.advance()?;
                Ok(ExprDesc::True)
            }
            Token::False => {
                self.advance()?;
                Ok(ExprDesc::False)
            }
            Token::DotDotDot => {
                self.advance()?;
                if !self.fs().proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                let line = self.line();
                let pc = self.emit_abc(OpCode::VarArg, 0, 0, 0, line);
                Ok(ExprDesc::Vararg(pc))
            }
            Token::LBrace => self.table_constructor(),
            Token::Function => {
                self.advance()?;
                self.function_body(false)
            }
            _ => self.suffixed_expression(),
        }
    }

    /// Name or parenthesised expression plus suffix chain.
    fn suffixed_expression(&mut self) -> Result<ExprDesc, CompileError> {
        // Calls in this chain are anchored at the register frontier of the
        // whole suffixed expression, so a call result always lands exactly
        // where a consumer of this expression expects its value.
        let mark = self.fs().scope.free_reg.max(self.num_locals());
        let expr = match self.current_token()?.clone() {
            Token::Name(name) => {
                self.advance()?;
                self.resolve_name(name)?
            }
            Token::LParen => {
                self.advance()?;
                let e = self.expression()?;
                self.expect(&Token::RParen)?;
                // Parentheses truncate to one value.
                let line = self.line();
                let reg = self.discharge_to_any_reg(&e, line)?;
                ExprDesc::Register(reg)
            }
            other => {
                return Err(self.error(format!("unexpected symbol near '{other}'")));
            }
        };
        self.finish_suffixes(expr, mark)
    }

    /// Suffix chain: `.field`, `[key]`, `:method(args)`, call args.
    fn finish_suffixes(&mut self, mut expr: ExprDesc, mark: u32) -> Result<ExprDesc, CompileError> {
        loop {
            match self.current_token()?.clone() {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    let line = self.line();
                    let table = self.discharge_to_any_reg(&expr, line)?;
                    let k = self.string_constant(&field);
                    let key = if k <= MAX_INDEX_RK {
                        RkOperand::Constant(k)
                    } else {
                        let r = self.alloc_reg()?;
                        self.emit_load_constant(r, k, line);
                        RkOperand::Register(r)
                    };
                    expr = ExprDesc::Indexed { table, key };
                }
                Token::LBracket => {
                    self.advance()?;
                    let line = self.line();
                    let table = self.discharge_to_any_reg(&expr, line)?;
                    let key_expr = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    let key = self.rk_operand(&key_expr, line)?;
                    expr = ExprDesc::Indexed { table, key };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let line = self.line();
                    expr = self.method_call(expr, method, mark, line)?;
                }
                Token::LParen | Token::LBrace | Token::Str(_) => {
                    let line = self.line();
                    expr = self.function_call(expr, mark, line)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Call anchored at `mark`: temporaries of the callee expression are
    /// released first, so the CALL (and its results) sit at the chain's
    /// frontier register. The released registers are only read, never
    /// written, before the call instruction executes.
    fn function_call(&mut self, func: ExprDesc, mark: u32, line: u32) -> Result<ExprDesc, CompileError> {
        self.free_to(mark);
        let base = self.alloc_reg()?;
        self.discharge_to_reg(&func, base, line)?;
        let (nargs, multret) = self.call_args(base + 1, line)?;
        let b = if multret { 0 } else { nargs + 1 };
        let pc = self.emit_abc(OpCode::Call, base, b, 2, line);
        self.free_to(base + 1);
        Ok(ExprDesc::Call(pc))
    }

    /// `obj:m(args)` — SELF places the method and receiver, then a call with
    /// the receiver as implicit first argument.
    fn method_call(
        &mut self,
        obj: ExprDesc,
        method: LuaStr,
        mark: u32,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        let objr = self.discharge_to_any_reg(&obj, line)?;
        self.free_to(mark);
        let base = self.alloc_reg()?;
        let _self_slot = self.alloc_reg()?;
        let k = self.string_constant(&method);
        let key = if k <= MAX_INDEX_RK {
            warden_core::opcode::rk_const(k)
        } else {
            return Err(self.error("too many constants in function"));
        };
        self.emit_abc(OpCode::Self_, base, objr, key, line);
        let (nargs, multret) = self.call_args(base + 2, line)?;
        let b = if multret { 0 } else { nargs + 2 };
        let pc = self.emit_abc(OpCode::Call, base, b, 2, line);
        self.free_to(base + 1);
        Ok(ExprDesc::Call(pc))
    }

    /// Parse call arguments into consecutive registers starting at
    /// `args_base`. Returns (count, last-was-multret).
    fn call_args(&mut self, args_base: u32, line: u32) -> Result<(u32, bool), CompileError> {
        debug_assert!(self.fs().scope.free_reg == args_base);
        match self.current_token()?.clone() {
            Token::LParen => {
                self.advance()?;
                if self.test_next(&Token::RParen)? {
                    return Ok((0, false));
                }
                let (n, multret) = self.explist_to_stack()?;
                self.expect(&Token::RParen)?;
                Ok((n, multret))
            }
            Token::LBrace => {
                let table = self.table_constructor()?;
                let r = self.alloc_reg()?;
                self.discharge_to_reg(&table, r, line)?;
                Ok((1, false))
            }
            Token::Str(s) => {
                self.advance()?;
                let r = self.alloc_reg()?;
                self.discharge_to_reg(&ExprDesc::Str(s), r, line)?;
                Ok((1, false))
            }
            other => Err(self.error(format!("function arguments expected near '{other}'"))),
        }
    }

    /// Comma-separated expressions pushed to consecutive registers at the
    /// current stack top. The last expression stays open (B/C = 0) when it is
    /// a call or vararg. Returns (count, last-was-multret).
    fn explist_to_stack(&mut self) -> Result<(u32, bool), CompileError> {
        let base = self.fs().scope.free_reg;
        let mut n = 0u32;
        loop {
            let line = self.line();
            let slot = base + n;
            let e = self.expression()?;
            n += 1;
            if self.test_next(&Token::Comma)? {
                self.free_to(slot);
                let r = self.alloc_reg()?;
                self.discharge_to_reg(&e, r, line)?;
                continue;
            }
            // Last expression.
            match e {
                ExprDesc::Call(pc) => {
                    // A whole-expression call was anchored at `slot`, so its
                    // results spread from there.
                    self.fs_mut().proto.get_mut(pc).set_c(0);
                    self.free_to(slot + 1);
                    return Ok((n, true));
                }
                ExprDesc::Vararg(pc) => {
                    self.free_to(slot);
                    let r = self.alloc_reg()?;
                    let inst = self.fs_mut().proto.get_mut(pc);
                    inst.set_a(r);
                    inst.set_b(0);
                    return Ok((n, true));
                }
                other => {
                    self.free_to(slot);
                    let r = self.alloc_reg()?;
                    self.discharge_to_reg(&other, r, line)?;
                    return Ok((n, false));
                }
            }
        }
    }

    /// Parse an expression list and adjust it to exactly `want` values in
    /// consecutive registers. Returns the base register.
    fn explist_adjust(&mut self, want: u32) -> Result<u32, CompileError> {
        let base = self.fs().scope.free_reg;
        let line = self.line();
        let (n, multret) = self.explist_to_stack()?;
        if multret {
            // The open call/vararg provides the remaining values.
            let needed = (want + 1).saturating_sub(n);
            let pc = self.last_open_pc()?;
            match self.fs().proto.code[pc].opcode() {
                Some(OpCode::Call) => self.fs_mut().proto.get_mut(pc).set_c(needed + 1),
                Some(OpCode::VarArg) => self.fs_mut().proto.get_mut(pc).set_b(needed + 1),
                _ => return Err(self.error("malformed expression list")),
            }
            if want > n {
                self.fs_mut().scope.alloc_regs(want - n);
            }
        } else if n < want {
            for i in n..want {
                let r = self.alloc_reg()?;
                debug_assert_eq!(r, base + i);
                self.emit_abc(OpCode::LoadNil, r, 0, 0, line);
            }
        }
        self.free_to(base + want);
        Ok(base)
    }

    /// The pc of the trailing open CALL/VARARG emitted by
    /// `explist_to_stack`.
    fn last_open_pc(&self) -> Result<usize, CompileError> {
        let code = &self.fs().proto.code;
        for pc in (0..code.len()).rev() {
            match code[pc].opcode() {
                Some(OpCode::Call) | Some(OpCode::VarArg) => return Ok(pc),
                Some(OpCode::ExtraArg) => continue,
                _ => continue,
            }
        }
        Err(self.error("malformed expression list"))
    }

    // ---- Operators ----

    fn check_unary_op(&self) -> Result<Option<UnOp>, CompileError> {
        Ok(match self.current_token()? {
            Token::Not => Some(UnOp::Not),
            Token::Minus => Some(UnOp::Neg),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        })
    }

    fn check_binary_op(&self) -> Result<Option<BinOp>, CompileError> {
        Ok(match self.current_token()? {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::DotDot => Some(BinOp::Concat),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::NotEq),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::LtEq),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::GtEq),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        })
    }

    fn code_unary_op(
        &mut self,
        op: UnOp,
        sub: ExprDesc,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        // Fold negation of numeric literals so loop steps stay constants.
        if op == UnOp::Neg {
            match sub {
                ExprDesc::Int(i) if i != i32::MIN => return Ok(ExprDesc::Int(-i)),
                ExprDesc::Num(f) => return Ok(ExprDesc::Num(-f)),
                _ => {}
            }
        }
        let mark = self.fs().scope.free_reg;
        let src = self.discharge_to_any_reg(&sub, line)?;
        self.free_to(mark);
        let dst = self.alloc_reg()?;
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
        };
        self.emit_abc(opcode, dst, src, 0, line);
        Ok(ExprDesc::Register(dst))
    }

    fn code_arith(
        &mut self,
        op: BinOp,
        left: ExprDesc,
        right: ExprDesc,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        let mark = self.fs().scope.free_reg;
        let b = self.rk_operand(&left, line)?;
        let c = self.rk_operand(&right, line)?;
        self.free_to(mark);
        let dst = self.alloc_reg()?;
        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            other => return Err(self.error(format!("not an arithmetic operator: {other:?}"))),
        };
        self.emit_abc(opcode, dst, b.encode(), c.encode(), line);
        Ok(ExprDesc::Register(dst))
    }

    /// Comparison materialised to a boolean register:
    /// `OP A rk rk; JMP +1; LOADBOOL r 0 1; LOADBOOL r 1 0`.
    fn code_comparison(
        &mut self,
        op: BinOp,
        left: ExprDesc,
        right: ExprDesc,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        let mark = self.fs().scope.free_reg;
        let mut b = self.rk_operand(&left, line)?;
        let mut c = self.rk_operand(&right, line)?;
        let (opcode, a_flag) = match op {
            BinOp::Eq => (OpCode::Eq, 1),
            BinOp::NotEq => (OpCode::Eq, 0),
            BinOp::Lt => (OpCode::Lt, 1),
            BinOp::LtEq => (OpCode::Le, 1),
            BinOp::Gt => {
                std::mem::swap(&mut b, &mut c);
                (OpCode::Lt, 1)
            }
            BinOp::GtEq => {
                std::mem::swap(&mut b, &mut c);
                (OpCode::Le, 1)
            }
            other => return Err(self.error(format!("not a comparison operator: {other:?}"))),
        };
        self.free_to(mark);
        self.emit_abc(opcode, a_flag, b.encode(), c.encode(), line);
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 1), line);
        let dst = self.alloc_reg()?;
        self.emit_abc(OpCode::LoadBool, dst, 0, 1, line);
        self.emit_abc(OpCode::LoadBool, dst, 1, 0, line);
        Ok(ExprDesc::Register(dst))
    }

    /// `and`/`or` with short-circuit evaluation into one register.
    fn code_short_circuit(
        &mut self,
        op: BinOp,
        left: ExprDesc,
        right_prec: u8,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        let dst = self.alloc_reg()?;
        self.discharge_to_reg(&left, dst, line)?;
        // TEST skips the JMP when the register decides the result early.
        let c = if op == BinOp::And { 0 } else { 1 };
        self.emit_abc(OpCode::Test, dst, 0, c, line);
        let jmp = self.emit_jump(line);
        let right = self.sub_expression(right_prec)?;
        self.discharge_to_reg(&right, dst, line)?;
        self.free_to(dst + 1);
        self.patch_jump(jmp);
        Ok(ExprDesc::Register(dst))
    }

    /// Concatenation over consecutive registers; right-associative collection
    /// into a single CONCAT B..C range.
    fn code_concat(&mut self, left: ExprDesc, line: u32) -> Result<ExprDesc, CompileError> {
        let first = self.alloc_reg()?;
        self.discharge_to_reg(&left, first, line)?;
        let mut last = first;
        loop {
            // Parse at concat's left priority so tighter operators are
            // absorbed but further `..` terms are collected by this loop.
            let slot = last + 1;
            let operand = self.sub_expression(9)?;
            self.free_to(slot);
            let r = self.alloc_reg()?;
            self.discharge_to_reg(&operand, r, line)?;
            last = r;
            if !self.test_next(&Token::DotDot)? {
                break;
            }
        }
        self.emit_abc(OpCode::Concat, first, first, last, line);
        self.free_to(first + 1);
        Ok(ExprDesc::Register(first))
    }

    // ---- Table constructor ----

    fn table_constructor(&mut self) -> Result<ExprDesc, CompileError> {
        let line = self.line();
        self.expect(&Token::LBrace)?;
        let treg = self.alloc_reg()?;
        let newtable_pc = self.emit_abc(OpCode::NewTable, treg, 0, 0, line);

        let mut array_count: u32 = 0;
        let mut hash_count: u32 = 0;
        let mut pending: u32 = 0;
        let mut open_tail = false;

        loop {
            if self.check(&Token::RBrace) {
                break;
            }
            let is_record_field = self.peek_is_assign()?;
            match self.current_token()?.clone() {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    let val = self.expression()?;
                    let mark = self.fs().scope.free_reg;
                    let krk = self.rk_operand(&key, line)?;
                    let vrk = self.rk_operand(&val, line)?;
                    self.emit_abc(OpCode::SetTable, treg, krk.encode(), vrk.encode(), line);
                    self.free_to(mark);
                    hash_count += 1;
                }
                Token::Name(name) if is_record_field => {
                    self.advance()?;
                    self.advance()?; // '='
                    let val = self.expression()?;
                    let mark = self.fs().scope.free_reg;
                    let k = self.string_constant(&name);
                    let krk = if k <= MAX_INDEX_RK {
                        warden_core::opcode::rk_const(k)
                    } else {
                        return Err(self.error("too many constants in function"));
                    };
                    let vrk = self.rk_operand(&val, line)?;
                    self.emit_abc(OpCode::SetTable, treg, krk, vrk.encode(), line);
                    self.free_to(mark);
                    hash_count += 1;
                }
                _ => {
                    let item_line = self.line();
                    let slot = treg + 1 + pending;
                    let val = self.expression()?;
                    let at_end = self.check(&Token::RBrace)
                        || (!self.check(&Token::Comma) && !self.check(&Token::Semi));
                    if at_end && val.is_multret() {
                        // Trailing call/vararg spreads into the array part.
                        match &val {
                            ExprDesc::Call(pc) => {
                                self.fs_mut().proto.get_mut(*pc).set_c(0);
                                self.free_to(slot + 1);
                            }
                            ExprDesc::Vararg(pc) => {
                                self.free_to(slot);
                                let r = self.alloc_reg()?;
                                let inst = self.fs_mut().proto.get_mut(*pc);
                                inst.set_a(r);
                                inst.set_b(0);
                            }
                            _ => unreachable!(),
                        }
                        pending += 1;
                        array_count += 1;
                        open_tail = true;
                    } else {
                        self.free_to(slot);
                        let r = self.alloc_reg()?;
                        self.discharge_to_reg(&val, r, item_line)?;
                        pending += 1;
                        array_count += 1;
                        if pending as usize == FIELDS_PER_FLUSH {
                            self.flush_setlist(treg, pending, array_count, false, line)?;
                            pending = 0;
                        }
                    }
                }
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
            if open_tail {
                return Err(self.error("multiple-value expression must close the constructor"));
            }
        }
        self.expect(&Token::RBrace)?;

        if pending > 0 || open_tail {
            self.flush_setlist(treg, pending, array_count, open_tail, line)?;
        }

        // Size hints use the log-approximated "floating point byte" encoding.
        let b = int2fb(array_count);
        let c = int2fb(hash_count);
        {
            let inst = self.fs_mut().proto.get_mut(newtable_pc);
            inst.set_b(b);
            inst.set_c(c);
        }
        self.free_to(treg + 1);
        Ok(ExprDesc::Register(treg))
    }

    fn peek_is_assign(&mut self) -> Result<bool, CompileError> {
        // `Name =` starts a record field; anything else is an array item.
        if let Ok(Token::Name(_)) = self.current_token() {
            Ok(self.lexer.next_starts_assign())
        } else {
            Ok(false)
        }
    }

    fn flush_setlist(
        &mut self,
        treg: u32,
        pending: u32,
        array_count: u32,
        open_tail: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        let batch = (array_count.saturating_sub(pending)) as usize / FIELDS_PER_FLUSH + 1;
        let b = if open_tail { 0 } else { pending };
        if (batch as u32) <= MAX_C {
            self.emit_abc(OpCode::SetList, treg, b, batch as u32, line);
        } else {
            self.emit_abc(OpCode::SetList, treg, b, 0, line);
            self.emit(Instruction::ax(OpCode::ExtraArg, batch as u32), line);
        }
        self.free_to(treg + 1);
        Ok(())
    }

    // ---- Name resolution ----

    fn resolve_name(&mut self, name: LuaStr) -> Result<ExprDesc, CompileError> {
        if let Some(reg) = self.fs().scope.resolve_local(&name) {
            return Ok(ExprDesc::Register(reg));
        }
        let top = self.func_stack.len() - 1;
        if let Some(idx) = self.resolve_upvalue(top, &name) {
            return Ok(ExprDesc::Upvalue(idx));
        }
        Ok(ExprDesc::Global(name))
    }

    /// Find or build the upvalue chain for `name` in function `fs_idx`.
    fn resolve_upvalue(&mut self, fs_idx: usize, name: &LuaStr) -> Option<u32> {
        if let Some(i) = self.func_stack[fs_idx]
            .upvalues
            .iter()
            .position(|u| u.name == *name)
        {
            return Some(i as u32);
        }
        if fs_idx == 0 {
            return None;
        }
        let parent = fs_idx - 1;
        if let Some(reg) = self.func_stack[parent].scope.resolve_local(name) {
            self.func_stack[parent].scope.mark_captured(reg);
            return Some(self.add_upvalue(fs_idx, name, true, reg as u8));
        }
        if let Some(up) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(fs_idx, name, false, up as u8));
        }
        None
    }

    fn add_upvalue(&mut self, fs_idx: usize, name: &LuaStr, in_stack: bool, index: u8) -> u32 {
        let ups = &mut self.func_stack[fs_idx].upvalues;
        ups.push(UpvalInfo {
            name: name.clone(),
            in_stack,
            index,
        });
        (ups.len() - 1) as u32
    }

    /// The `_ENV` upvalue of the current function, creating the chain down
    /// from the chunk when needed.
    fn env_upvalue(&mut self) -> Result<u32, CompileError> {
        let env_name = LuaStr::from("_ENV");
        let top = self.func_stack.len() - 1;
        self.resolve_upvalue(top, &env_name)
            .ok_or_else(|| self.error("no environment in scope"))
    }

    // ---- Function bodies ----

    pub(crate) fn function_body(&mut self, is_method: bool) -> Result<ExprDesc, CompileError> {
        let line_defined = self.line();
        let mut fs = FuncState::new(self.chunk_name.clone());
        fs.proto.line_defined = line_defined;
        self.func_stack.push(fs);
        self.fs_mut().scope.enter_block(false);

        if is_method {
            let self_name = LuaStr::from("self");
            self.fs_mut().scope.add_local(self_name, 0);
        }
        self.expect(&Token::LParen)?;
        self.parse_param_list()?;
        self.expect(&Token::RParen)?;
        self.block()?;
        self.expect(&Token::End)?;
        let last_line = self.lexer.lastline;

        let mut proto = self.close_function()?;
        proto.last_line_defined = last_line;

        // Install as a child of the enclosing function and build the closure.
        let parent = self.fs_mut();
        let idx = parent.proto.protos.len() as u32;
        parent.proto.protos.push(Arc::new(proto));
        let dst = self.alloc_reg()?;
        self.emit_abx(OpCode::Closure, dst, idx, line_defined);
        Ok(ExprDesc::Register(dst))
    }

    fn parse_param_list(&mut self) -> Result<(), CompileError> {
        if self.check(&Token::RParen) {
            self.fs_mut().proto.num_params = self.fs().scope.locals.len() as u8;
            return Ok(());
        }
        loop {
            match self.current_token()?.clone() {
                Token::Name(name) => {
                    self.advance()?;
                    self.fs_mut().scope.add_local(name, 0);
                }
                Token::DotDotDot => {
                    self.advance()?;
                    self.fs_mut().proto.is_vararg = true;
                    break;
                }
                other => return Err(self.error(format!("<name> expected near '{other}'"))),
            }
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        self.fs_mut().proto.num_params = self.fs().scope.locals.len() as u8;
        Ok(())
    }

    /// Finish the innermost function: implicit return, goto resolution,
    /// debug info. Pops and returns the prototype.
    fn close_function(&mut self) -> Result<Prototype, CompileError> {
        let line = self.lexer.lastline;
        self.emit_abc(OpCode::Return, 0, 1, 0, line);

        let fs = self.func_stack.last_mut().unwrap();
        fs.scope.leave_block();

        // Resolve gotos against the function's labels.
        let gotos = std::mem::take(&mut fs.scope.pending_gotos);
        let labels = fs.scope.labels.clone();
        for g in gotos {
            match labels.iter().find(|l| l.name == g.name) {
                Some(label) => {
                    let offset = label.pc as i32 - g.pc as i32 - 1;
                    fs.proto.get_mut(g.pc).set_sbx(offset);
                }
                None => {
                    return Err(CompileError {
                        message: format!("no visible label '{}' for goto", g.name),
                        line: g.line,
                    });
                }
            }
        }

        let mut fs = self.func_stack.pop().unwrap();
        if fs.scope.max_reg > 254 {
            return Err(CompileError {
                message: "function or expression too complex".into(),
                line,
            });
        }
        fs.proto.max_stack_size = (fs.scope.max_reg.max(2)) as u8;
        let code_len = fs.proto.code_len() as u32;
        for (name, start_pc) in &fs.scope.debug_locals {
            fs.proto.locals.push(LocalVar {
                name: name.clone(),
                start_pc: *start_pc,
                end_pc: code_len,
            });
        }
        fs.proto.upvalues = fs
            .upvalues
            .iter()
            .map(|u| UpvalDesc {
                name: Some(u.name.clone()),
                in_stack: u.in_stack,
                index: u.index,
            })
            .collect();
        Ok(fs.proto)
    }

    // ---- Blocks & statements ----

    pub(crate) fn block(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current_token()? {
                Token::End | Token::Eof | Token::Until | Token::Else | Token::ElseIf => {
                    return Ok(())
                }
                Token::Return => {
                    self.stat_return()?;
                    return Ok(());
                }
                _ => self.statement()?,
            }
            // Reclaim statement temporaries.
            let nlocals = self.num_locals();
            self.free_to(nlocals);
        }
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.current_token()?.clone() {
            Token::Semi => {
                self.advance()?;
                Ok(())
            }
            Token::If => self.stat_if(),
            Token::While => self.stat_while(),
            Token::Do => self.stat_do(),
            Token::For => self.stat_for(),
            Token::Repeat => self.stat_repeat(),
            Token::Function => self.stat_function(),
            Token::Local => self.stat_local(),
            Token::Break => self.stat_break(),
            Token::Goto => self.stat_goto(),
            Token::DoubleColon => self.stat_label(),
            _ => self.stat_expr_or_assign(),
        }
    }

    fn stat_local(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'local'
        if self.test_next(&Token::Function)? {
            // local function f: the name is in scope inside the body.
            let name = self.expect_name()?;
            let start_pc = self.current_pc() as u32;
            let reg = self.fs_mut().scope.add_local(name, start_pc);
            let body = self.function_body(false)?;
            let line = self.lexer.lastline;
            self.discharge_to_reg(&body, reg, line)?;
            self.free_to(reg + 1);
            return Ok(());
        }

        let mut names = vec![self.expect_name()?];
        while self.test_next(&Token::Comma)? {
            names.push(self.expect_name()?);
        }
        let want = names.len() as u32;
        let line = self.line();
        let base = if self.test_next(&Token::Assign)? {
            self.explist_adjust(want)?
        } else {
            let base = self.fs().scope.free_reg;
            for i in 0..want {
                let r = self.alloc_reg()?;
                debug_assert_eq!(r, base + i);
                self.emit_abc(OpCode::LoadNil, r, 0, 0, line);
            }
            base
        };
        // Register the locals only now, so the initialisers see outer scope.
        let start_pc = self.current_pc() as u32;
        let fs = self.fs_mut();
        fs.scope.free_reg_to(base);
        for name in names {
            fs.scope.add_local(name, start_pc);
        }
        Ok(())
    }

    fn stat_if(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'if'
        let mut end_jumps = Vec::new();
        loop {
            let line = self.line();
            let cond = self.expression()?;
            let jf = self.cond_jump_false(&cond, line)?;
            self.expect(&Token::Then)?;
            self.fs_mut().scope.enter_block(false);
            self.block()?;
            self.leave_scope_block();

            match self.current_token()?.clone() {
                Token::ElseIf => {
                    self.advance()?;
                    end_jumps.push(self.emit_jump(line));
                    self.patch_jump(jf);
                    continue;
                }
                Token::Else => {
                    self.advance()?;
                    let skip_else = self.emit_jump(line);
                    self.patch_jump(jf);
                    self.fs_mut().scope.enter_block(false);
                    self.block()?;
                    self.leave_scope_block();
                    self.expect(&Token::End)?;
                    self.patch_jump(skip_else);
                    break;
                }
                Token::End => {
                    self.advance()?;
                    self.patch_jump(jf);
                    break;
                }
                other => {
                    return Err(self.error(format!("'end' expected near '{other}'")));
                }
            }
        }
        for j in end_jumps {
            self.patch_jump(j);
        }
        Ok(())
    }

    /// Test the condition and emit a jump taken when it is false; returns the
    /// jump pc to patch.
    fn cond_jump_false(&mut self, cond: &ExprDesc, line: u32) -> Result<usize, CompileError> {
        let mark = self.fs().scope.free_reg;
        let reg = self.discharge_to_any_reg(cond, line)?;
        self.free_to(mark.max(self.num_locals()));
        self.emit_abc(OpCode::Test, reg, 0, 0, line);
        Ok(self.emit_jump(line))
    }

    fn stat_while(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'while'
        let line = self.line();
        let start = self.current_pc();
        let cond = self.expression()?;
        let jf = self.cond_jump_false(&cond, line)?;
        self.expect(&Token::Do)?;
        self.fs_mut().scope.enter_block(true);
        self.block()?;
        self.expect(&Token::End)?;
        let block = self.leave_loop_block();
        let back = self.emit_jump(line);
        self.patch_jump_to(back, start);
        self.patch_jump(jf);
        self.patch_breaks(block);
        Ok(())
    }

    fn stat_repeat(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'repeat'
        let line = self.line();
        let start = self.current_pc();
        // The block stays open through the condition: until sees its locals.
        self.fs_mut().scope.enter_block(true);
        self.block()?;
        self.expect(&Token::Until)?;
        let cond = self.expression()?;
        let jback = self.cond_jump_false(&cond, line)?;
        self.patch_jump_to(jback, start);
        let block = self.leave_loop_block();
        self.patch_breaks(block);
        Ok(())
    }

    fn stat_do(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        self.fs_mut().scope.enter_block(false);
        self.block()?;
        self.expect(&Token::End)?;
        self.leave_scope_block();
        Ok(())
    }

    fn stat_for(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'for'
        let first_name = self.expect_name()?;
        match self.current_token()?.clone() {
            Token::Assign => self.stat_for_numeric(first_name),
            Token::Comma | Token::In => self.stat_for_generic(first_name),
            other => Err(self.error(format!("'=' or 'in' expected near '{other}'"))),
        }
    }

    fn stat_for_numeric(&mut self, var_name: LuaStr) -> Result<(), CompileError> {
        self.advance()?; // '='
        let line = self.line();
        let base = self.fs().scope.free_reg;

        let init = self.expression()?;
        self.free_to(base);
        let r = self.alloc_reg()?;
        self.discharge_to_reg(&init, r, line)?;
        self.expect(&Token::Comma)?;
        let limit = self.expression()?;
        self.free_to(base + 1);
        let r = self.alloc_reg()?;
        self.discharge_to_reg(&limit, r, line)?;
        let step = if self.test_next(&Token::Comma)? {
            self.expression()?
        } else {
            ExprDesc::Int(1)
        };
        self.free_to(base + 2);
        let r = self.alloc_reg()?;
        self.discharge_to_reg(&step, r, line)?;
        self.expect(&Token::Do)?;

        // Reserve the three control registers as unnamed locals, then the
        // user variable above them.
        let start_pc = self.current_pc() as u32;
        {
            let fs = self.fs_mut();
            fs.scope.free_reg_to(base);
            fs.scope.add_local(LuaStr::from("(for index)"), start_pc);
            fs.scope.add_local(LuaStr::from("(for limit)"), start_pc);
            fs.scope.add_local(LuaStr::from("(for step)"), start_pc);
        }
        let prep = self.emit(Instruction::asbx(OpCode::ForPrep, base, 0), line);

        self.fs_mut().scope.enter_block(true);
        self.fs_mut().scope.add_local(var_name, start_pc + 1);
        self.block()?;
        self.expect(&Token::End)?;
        let block = self.leave_loop_block();

        let loop_pc = self.current_pc();
        self.patch_jump_to(prep, loop_pc);
        let body_start = prep + 1;
        let back = body_start as i32 - loop_pc as i32 - 1;
        self.emit(Instruction::asbx(OpCode::ForLoop, base, back), line);
        self.patch_breaks(block);

        // Release the control variables.
        let fs = self.fs_mut();
        fs.scope.locals.truncate(fs.scope.locals.len() - 3);
        fs.scope.free_reg_to(base);
        Ok(())
    }

    fn stat_for_generic(&mut self, first_name: LuaStr) -> Result<(), CompileError> {
        let mut names = vec![first_name];
        while self.test_next(&Token::Comma)? {
            names.push(self.expect_name()?);
        }
        self.expect(&Token::In)?;
        let line = self.line();
        let base = self.explist_adjust(3)?;
        self.expect(&Token::Do)?;

        let start_pc = self.current_pc() as u32;
        {
            let fs = self.fs_mut();
            fs.scope.free_reg_to(base);
            fs.scope.add_local(LuaStr::from("(for generator)"), start_pc);
            fs.scope.add_local(LuaStr::from("(for state)"), start_pc);
            fs.scope.add_local(LuaStr::from("(for control)"), start_pc);
        }
        let nvars = names.len() as u32;
        let prep = self.emit_jump(line);

        self.fs_mut().scope.enter_block(true);
        for name in names {
            self.fs_mut().scope.add_local(name, start_pc + 1);
        }
        let body_start = self.current_pc();
        self.block()?;
        self.expect(&Token::End)?;
        let block = self.leave_loop_block();

        self.patch_jump(prep);
        self.emit_abc(OpCode::TForCall, base, 0, nvars, line);
        let back = body_start as i32 - (self.current_pc() as i32 + 1);
        self.emit(Instruction::asbx(OpCode::TForLoop, base + 2, back), line);
        self.patch_breaks(block);

        let fs = self.fs_mut();
        fs.scope.locals.truncate(fs.scope.locals.len() - 3);
        fs.scope.free_reg_to(base);
        Ok(())
    }

    fn stat_function(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'function'
        let line = self.line();
        let first = self.expect_name()?;
        let mut target = self.resolve_name(first)?;
        let mut is_method = false;
        loop {
            match self.current_token()?.clone() {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    let table = self.discharge_to_any_reg(&target, line)?;
                    let k = self.string_constant(&field);
                    if k > MAX_INDEX_RK {
                        return Err(self.error("too many constants in function"));
                    }
                    target = ExprDesc::Indexed {
                        table,
                        key: RkOperand::Constant(k),
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let table = self.discharge_to_any_reg(&target, line)?;
                    let k = self.string_constant(&method);
                    if k > MAX_INDEX_RK {
                        return Err(self.error("too many constants in function"));
                    }
                    target = ExprDesc::Indexed {
                        table,
                        key: RkOperand::Constant(k),
                    };
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let body = self.function_body(is_method)?;
        self.code_store(&target, &body, line)?;
        Ok(())
    }

    fn stat_return(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'return'
        let line = self.lexer.lastline;
        let block_ends = matches!(
            self.current_token()?,
            Token::End | Token::Eof | Token::Until | Token::Else | Token::ElseIf | Token::Semi
        );
        if block_ends {
            self.emit_abc(OpCode::Return, 0, 1, 0, line);
            self.test_next(&Token::Semi)?;
            return Ok(());
        }
        let base = self.fs().scope.free_reg;
        let (n, multret) = self.explist_to_stack()?;
        if multret {
            if n == 1 {
                // `return f(...)` becomes a proper tail call.
                let pc = self.last_open_pc()?;
                let inst = self.fs_mut().proto.get_mut(pc);
                if inst.opcode() == Some(OpCode::Call) {
                    let a = inst.a();
                    let b = inst.b();
                    *inst = Instruction::abc(OpCode::TailCall, a, b, 0);
                    self.emit_abc(OpCode::Return, a, 0, 0, line);
                    self.test_next(&Token::Semi)?;
                    self.free_to(base);
                    return Ok(());
                }
            }
            self.emit_abc(OpCode::Return, base, 0, 0, line);
        } else {
            self.emit_abc(OpCode::Return, base, n + 1, 0, line);
        }
        self.test_next(&Token::Semi)?;
        self.free_to(base);
        Ok(())
    }

    fn stat_break(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let line = self.lexer.lastline;
        let pc = self.emit_jump(line);
        match self.fs_mut().scope.find_loop_block_mut() {
            Some(block) => {
                block.break_jumps.push(pc);
                Ok(())
            }
            None => Err(self.error("break outside a loop")),
        }
    }

    fn stat_goto(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let name = self.expect_name()?;
        let line = self.lexer.lastline;
        let pc = self.emit_jump(line);
        self.fs_mut()
            .scope
            .pending_gotos
            .push(PendingGoto { name, pc, line });
        Ok(())
    }

    fn stat_label(&mut self) -> Result<(), CompileError> {
        self.advance()?; // '::'
        let name = self.expect_name()?;
        self.expect(&Token::DoubleColon)?;
        let pc = self.current_pc();
        self.fs_mut().scope.labels.push(LabelInfo { name, pc });
        Ok(())
    }

    fn stat_expr_or_assign(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        let first = self.suffixed_expression()?;

        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.test_next(&Token::Comma)? {
                targets.push(self.suffixed_expression()?);
            }
            self.expect(&Token::Assign)?;
            for t in &targets {
                if !matches!(
                    t,
                    ExprDesc::Register(_)
                        | ExprDesc::Upvalue(_)
                        | ExprDesc::Global(_)
                        | ExprDesc::Indexed { .. }
                ) {
                    return Err(self.error("cannot assign to this expression"));
                }
            }
            let want = targets.len() as u32;
            let base = self.explist_adjust(want)?;
            for (i, target) in targets.iter().enumerate() {
                let value = ExprDesc::Register(base + i as u32);
                self.code_store(target, &value, line)?;
            }
            return Ok(());
        }

        match first {
            ExprDesc::Call(pc) => {
                // Expression statement: discard results.
                self.fs_mut().proto.get_mut(pc).set_c(1);
                Ok(())
            }
            _ => Err(self.error("syntax error near unexpected expression")),
        }
    }

    fn code_store(
        &mut self,
        target: &ExprDesc,
        value: &ExprDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match target {
            ExprDesc::Register(r) => {
                self.discharge_to_reg(value, *r, line)?;
            }
            ExprDesc::Upvalue(idx) => {
                let vr = self.discharge_to_any_reg(value, line)?;
                self.emit_abc(OpCode::SetUpval, vr, *idx, 0, line);
            }
            ExprDesc::Global(name) => {
                let env = self.env_upvalue()?;
                let k = self.string_constant(&name.clone());
                if k > MAX_INDEX_RK {
                    return Err(self.error("too many constants in function"));
                }
                let vrk = self.rk_operand(value, line)?;
                self.emit_abc(
                    OpCode::SetTabUp,
                    env,
                    warden_core::opcode::rk_const(k),
                    vrk.encode(),
                    line,
                );
            }
            ExprDesc::Indexed { table, key } => {
                let vrk = self.rk_operand(value, line)?;
                self.emit_abc(OpCode::SetTable, *table, key.encode(), vrk.encode(), line);
            }
            _ => return Err(self.error("cannot assign to this expression")),
        }
        Ok(())
    }

    // ---- Block helpers ----

    /// Leave a non-loop block, closing captured upvalues with a zero-offset
    /// jump when needed.
    fn leave_scope_block(&mut self) {
        let line = self.lexer.lastline;
        let entry_reg = {
            let fs = self.fs_mut();
            let block = fs.scope.leave_block();
            if block.has_captured_local {
                Some(block.first_free_reg_on_entry)
            } else {
                None
            }
        };
        if let Some(reg) = entry_reg {
            self.emit(Instruction::asbx(OpCode::Jmp, reg + 1, 0), line);
        }
    }

    /// Leave a loop block; returns it so break jumps can be patched after
    /// the loop's closing instruction.
    fn leave_loop_block(&mut self) -> scope::BlockScope {
        let line = self.lexer.lastline;
        let block = self.fs_mut().scope.leave_block();
        if block.has_captured_local {
            // Close per-iteration captures before looping back.
            self.emit(
                Instruction::asbx(OpCode::Jmp, block.first_free_reg_on_entry + 1, 0),
                line,
            );
        }
        block
    }

    fn patch_breaks(&mut self, block: scope::BlockScope) {
        let close_a = if block.has_captured_local {
            block.first_free_reg_on_entry + 1
        } else {
            0
        };
        let target = self.current_pc();
        for pc in block.break_jumps {
            let offset = target as i32 - pc as i32 - 1;
            let inst = self.fs_mut().proto.get_mut(pc);
            inst.set_sbx(offset);
            if close_a > 0 {
                inst.set_a(close_a);
            }
        }
    }
}
