//! Metamethod lookup and the per-class metatable registry.
//!
//! Tables and userdata carry their own metatable; every other type shares a
//! class-level metatable held in a process-global, lock-guarded registry
//! (installed by the string library for strings, available to hosts for the
//! rest).

use parking_lot::RwLock;
use warden_core::table::TableRef;
use warden_core::value::Value;

pub const MM_INDEX: &str = "__index";
pub const MM_NEWINDEX: &str = "__newindex";
pub const MM_CALL: &str = "__call";
pub const MM_LEN: &str = "__len";
pub const MM_CONCAT: &str = "__concat";
pub const MM_EQ: &str = "__eq";
pub const MM_LT: &str = "__lt";
pub const MM_LE: &str = "__le";
pub const MM_UNM: &str = "__unm";
pub const MM_TOSTRING: &str = "__tostring";
pub const MM_METATABLE: &str = "__metatable";
pub const MM_MODE: &str = "__mode";

/// Class slot for a non-table value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueClass {
    Nil,
    Boolean,
    Number,
    Str,
    Function,
    Thread,
}

#[derive(Default)]
struct ClassMetatables {
    nil: Option<TableRef>,
    boolean: Option<TableRef>,
    number: Option<TableRef>,
    string: Option<TableRef>,
    function: Option<TableRef>,
    thread: Option<TableRef>,
}

static CLASS_MT: RwLock<ClassMetatables> = RwLock::new(ClassMetatables {
    nil: None,
    boolean: None,
    number: None,
    string: None,
    function: None,
    thread: None,
});

pub fn set_class_metatable(class: ValueClass, mt: Option<TableRef>) {
    let mut reg = CLASS_MT.write();
    match class {
        ValueClass::Nil => reg.nil = mt,
        ValueClass::Boolean => reg.boolean = mt,
        ValueClass::Number => reg.number = mt,
        ValueClass::Str => reg.string = mt,
        ValueClass::Function => reg.function = mt,
        ValueClass::Thread => reg.thread = mt,
    }
}

/// The metatable governing `v`, if any.
pub fn metatable_of(v: &Value) -> Option<TableRef> {
    match v {
        Value::Table(t) => t.metatable(),
        Value::Userdata(u) => u.metatable.lock().clone(),
        Value::Nil => CLASS_MT.read().nil.clone(),
        Value::Boolean(_) => CLASS_MT.read().boolean.clone(),
        Value::Integer(_) | Value::Number(_) => CLASS_MT.read().number.clone(),
        Value::Str(_) => CLASS_MT.read().string.clone(),
        Value::Function(_) => CLASS_MT.read().function.clone(),
        Value::Thread(_) => CLASS_MT.read().thread.clone(),
    }
}

/// Look up a named metamethod on `v`. Nil slots count as absent.
pub fn get_metamethod(v: &Value, name: &str) -> Option<Value> {
    let mt = metatable_of(v)?;
    let mm = mt.get_str(name);
    if mm.is_nil() {
        None
    } else {
        Some(mm)
    }
}
