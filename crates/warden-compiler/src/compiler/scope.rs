/// Scope, register and label management for one function being compiled.
use warden_core::string::LuaStr;

/// An active local variable.
#[derive(Clone, Debug)]
pub struct LocalVarInfo {
    pub name: LuaStr,
    pub reg: u32,
    pub start_pc: u32,
}

/// A lexical block.
#[derive(Clone, Debug)]
pub struct BlockScope {
    pub num_locals_on_entry: usize,
    pub first_free_reg_on_entry: u32,
    pub is_loop: bool,
    /// JMP pcs waiting for the loop end.
    pub break_jumps: Vec<usize>,
    /// A local declared in this block is captured by a closure; leaving the
    /// block must close upvalues at or above its entry register.
    pub has_captured_local: bool,
}

/// A `::label::` seen in the function.
#[derive(Clone, Debug)]
pub struct LabelInfo {
    pub name: LuaStr,
    pub pc: usize,
}

/// A `goto` waiting for its label.
#[derive(Clone, Debug)]
pub struct PendingGoto {
    pub name: LuaStr,
    pub pc: usize,
    pub line: u32,
}

pub struct ScopeManager {
    pub locals: Vec<LocalVarInfo>,
    pub blocks: Vec<BlockScope>,
    /// Next available register.
    pub free_reg: u32,
    /// High-water mark of register usage.
    pub max_reg: u32,
    pub labels: Vec<LabelInfo>,
    pub pending_gotos: Vec<PendingGoto>,
    /// Every local ever declared, for the prototype's debug info (the live
    /// `locals` list shrinks as blocks close).
    pub debug_locals: Vec<(LuaStr, u32)>,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            blocks: Vec::new(),
            free_reg: 0,
            max_reg: 0,
            labels: Vec::new(),
            pending_gotos: Vec::new(),
            debug_locals: Vec::new(),
        }
    }

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            num_locals_on_entry: self.locals.len(),
            first_free_reg_on_entry: self.free_reg,
            is_loop,
            break_jumps: Vec::new(),
            has_captured_local: false,
        });
    }

    /// Pop the innermost block, dropping its locals and registers.
    pub fn leave_block(&mut self) -> BlockScope {
        let block = self.blocks.pop().expect("mismatched block");
        self.locals.truncate(block.num_locals_on_entry);
        self.free_reg = block.first_free_reg_on_entry;
        block
    }

    /// Declare a local in the next register.
    pub fn add_local(&mut self, name: LuaStr, start_pc: u32) -> u32 {
        let reg = self.alloc_reg();
        self.debug_locals.push((name.clone(), start_pc));
        self.locals.push(LocalVarInfo {
            name,
            reg,
            start_pc,
        });
        reg
    }

    pub fn alloc_reg(&mut self) -> u32 {
        let reg = self.free_reg;
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    pub fn alloc_regs(&mut self, n: u32) -> u32 {
        let first = self.free_reg;
        self.free_reg += n;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        first
    }

    pub fn free_reg_to(&mut self, level: u32) {
        debug_assert!(level <= self.free_reg);
        self.free_reg = level;
    }

    /// Innermost local with this name.
    pub fn resolve_local(&self, name: &LuaStr) -> Option<u32> {
        self.locals
            .iter()
            .rev()
            .find(|v| v.name == *name)
            .map(|v| v.reg)
    }

    /// Mark the block owning `reg` as needing upvalue closing on exit.
    pub fn mark_captured(&mut self, reg: u32) {
        for block in self.blocks.iter_mut().rev() {
            if reg >= block.first_free_reg_on_entry {
                block.has_captured_local = true;
                return;
            }
        }
        if let Some(outermost) = self.blocks.first_mut() {
            outermost.has_captured_local = true;
        }
    }

    pub fn find_loop_block_mut(&mut self) -> Option<&mut BlockScope> {
        self.blocks.iter_mut().rev().find(|b| b.is_loop)
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
