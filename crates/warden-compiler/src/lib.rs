//! Lua 5.2 source-to-bytecode compiler for the warden sandbox.
//!
//! The only entry point is [`compile`]: source text in, prototype forest out.
//! There is deliberately no binary-chunk reader anywhere in this crate.

pub mod compiler;
pub mod lexer;
pub mod token;

pub use compiler::{compile, CompileError};
