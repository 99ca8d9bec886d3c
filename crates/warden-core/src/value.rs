/// Tagged Lua value representation.
///
/// Small values (nil, booleans, 32-bit integers, doubles) are stored inline;
/// strings, tables, functions, threads and userdata are `Arc`-backed handles
/// so values can cross the resumer/worker boundary. `WeakValue` is the
/// explicit weak form used by weak table slots.
///
/// Integer and Number are distinct tags that coerce implicitly in arithmetic;
/// equality between them compares by mathematical value.
use crate::error::LuaError;
use crate::proto::Prototype;
use crate::string::LuaStr;
use crate::table::{Table, TableRef};
use crate::thread::LuaThread;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

pub type ThreadRef = Arc<LuaThread>;
pub type UserdataRef = Arc<Userdata>;
pub type UpvalueRef = Arc<Mutex<Upvalue>>;

/// A Lua value.
///
/// `PartialEq` delegates to [`Value::raw_eq`] (no metamethods).
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    Str(LuaStr),
    Table(TableRef),
    Function(Function),
    Thread(ThreadRef),
    Userdata(UserdataRef),
}

/// A callable: a compiled closure or a registered host callable.
#[derive(Clone)]
pub enum Function {
    Lua(Arc<Closure>),
    Native(Arc<NativeFunction>),
}

/// Runtime binding of a prototype to upvalues and a globals table.
pub struct Closure {
    pub proto: Arc<Prototype>,
    pub upvalues: Vec<UpvalueRef>,
    pub globals: TableRef,
}

/// An upvalue cell: open cells index a slot in the executing context's
/// register stack; closed cells own the value.
#[derive(Clone, Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// Opaque host payload with an optional metatable. No host object graph is
/// bridged: scripts only ever see the handle.
pub struct Userdata {
    pub data: Box<dyn Any + Send + Sync>,
    pub metatable: Mutex<Option<TableRef>>,
}

pub type NativeResult = Result<Vec<Value>, LuaError>;

/// A host callable registered by name. The boxed closure may capture host
/// state; it receives a call scope for re-entering the interpreter, charging
/// the instruction budget, or touching the console queue.
pub struct NativeFunction {
    pub name: String,
    func: Box<dyn Fn(&mut dyn crate::native::NativeCallScope, &[Value]) -> NativeResult + Send + Sync>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut dyn crate::native::NativeCallScope, &[Value]) -> NativeResult
            + Send
            + Sync
            + 'static,
    {
        NativeFunction {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn invoke(
        &self,
        scope: &mut dyn crate::native::NativeCallScope,
        args: &[Value],
    ) -> NativeResult {
        (self.func)(scope, args)
    }
}

impl Value {
    pub fn str(s: impl Into<LuaStr>) -> Self {
        Value::Str(s.into())
    }

    pub fn table(t: Table) -> Self {
        Value::Table(TableRef::new(t))
    }

    pub fn closure(c: Closure) -> Self {
        Value::Function(Function::Lua(Arc::new(c)))
    }

    pub fn native(f: NativeFunction) -> Self {
        Value::Function(Function::Native(Arc::new(f)))
    }

    // ---- Type checks ----

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Value::Table(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Lua truthiness: everything except nil and false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_falsy(&self) -> bool {
        !self.is_truthy()
    }

    // ---- Extractors ----

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer view with integral doubles folded in.
    pub fn as_integer_exact(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(f) if f.fract() == 0.0 && *f >= i32::MIN as f64 && *f <= i32::MAX as f64 => {
                Some(*f as i32)
            }
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&LuaStr> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&ThreadRef> {
        match self {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Lua type name as seen by `type()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
            Value::Userdata(_) => "userdata",
        }
    }

    /// Pointer identity for heap values, None for inline values.
    pub fn heap_id(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.ptr_id()),
            Value::Table(t) => Some(t.ptr_id()),
            Value::Function(Function::Lua(c)) => Some(Arc::as_ptr(c) as usize),
            Value::Function(Function::Native(f)) => Some(Arc::as_ptr(f) as usize),
            Value::Thread(t) => Some(Arc::as_ptr(t) as usize),
            Value::Userdata(u) => Some(Arc::as_ptr(u) as usize),
            _ => None,
        }
    }

    /// Raw equality (`rawequal`, table keys): no metamethods. Strings compare
    /// by bytes, numbers by mathematical value, heap values by identity.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_eq(b),
            (Value::Function(Function::Lua(a)), Value::Function(Function::Lua(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Function(Function::Native(a)), Value::Function(Function::Native(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Thread(a), Value::Thread(b)) => Arc::ptr_eq(a, b),
            (Value::Userdata(a), Value::Userdata(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_eq(other)
    }
}

impl Value {
    /// Downgrade to the weak form. Inline values and strings stay strong
    /// (strings are effectively permanent in this model).
    pub fn downgrade(&self) -> WeakValue {
        match self {
            Value::Table(t) => WeakValue::Table(t.downgrade()),
            Value::Function(Function::Lua(c)) => WeakValue::Closure(Arc::downgrade(c)),
            Value::Function(Function::Native(f)) => WeakValue::Native(Arc::downgrade(f)),
            Value::Thread(t) => WeakValue::Thread(Arc::downgrade(t)),
            Value::Userdata(u) => WeakValue::Userdata(Arc::downgrade(u)),
            other => WeakValue::Strong(other.clone()),
        }
    }

    /// True if `downgrade` would produce a genuinely weak reference.
    pub fn is_collectible(&self) -> bool {
        matches!(
            self,
            Value::Table(_) | Value::Function(_) | Value::Thread(_) | Value::Userdata(_)
        )
    }
}

/// Weak form of a value, used by weak-keyed/weak-valued table slots and
/// anywhere a reference must not keep its target alive.
#[derive(Clone)]
pub enum WeakValue {
    Strong(Value),
    Table(Weak<Mutex<Table>>),
    Closure(Weak<Closure>),
    Native(Weak<NativeFunction>),
    Thread(Weak<LuaThread>),
    Userdata(Weak<Userdata>),
}

impl WeakValue {
    /// Upgrade back to a value; None means the target was dropped.
    pub fn upgrade(&self) -> Option<Value> {
        match self {
            WeakValue::Strong(v) => Some(v.clone()),
            WeakValue::Table(w) => w.upgrade().map(|arc| Value::Table(TableRef::from_arc(arc))),
            WeakValue::Closure(w) => w.upgrade().map(|c| Value::Function(Function::Lua(c))),
            WeakValue::Native(w) => w.upgrade().map(|f| Value::Function(Function::Native(f))),
            WeakValue::Thread(w) => w.upgrade().map(Value::Thread),
            WeakValue::Userdata(w) => w.upgrade().map(Value::Userdata),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Table(t) => write!(f, "table: {:#x}", t.ptr_id()),
            Value::Function(Function::Lua(c)) => {
                write!(f, "function: {:#x}", Arc::as_ptr(c) as usize)
            }
            Value::Function(Function::Native(n)) => write!(f, "function: builtin '{}'", n.name),
            Value::Thread(t) => write!(f, "thread: {:#x}", Arc::as_ptr(t) as usize),
            Value::Userdata(u) => write!(f, "userdata: {:#x}", Arc::as_ptr(u) as usize),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(LuaStr::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(LuaStr::from(s))
    }
}

/// Fold an i64 back into the value model: Integer when it fits in 32 bits,
/// Number otherwise. This is the demotion step of widen-to-64 arithmetic.
pub fn value_of_i64(i: i64) -> Value {
    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
        Value::Integer(i as i32)
    } else {
        Value::Number(i as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Nil.is_falsy());
        assert!(Value::Boolean(false).is_falsy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::from("").is_truthy());
    }

    #[test]
    fn test_cross_tag_numeric_equality() {
        assert!(Value::Integer(3).raw_eq(&Value::Number(3.0)));
        assert!(!Value::Integer(3).raw_eq(&Value::Number(3.5)));
        assert!(Value::Number(2.0).raw_eq(&Value::Integer(2)));
    }

    #[test]
    fn test_nan_not_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(!nan.raw_eq(&nan));
    }

    #[test]
    fn test_string_raw_eq_by_bytes() {
        let long = vec![b'z'; 80];
        let a = Value::Str(LuaStr::new(&long));
        let b = Value::Str(LuaStr::new(&long));
        assert!(a.raw_eq(&b));
    }

    #[test]
    fn test_table_identity() {
        let a = Value::table(Table::new(0, 0));
        let b = Value::table(Table::new(0, 0));
        assert!(a.raw_eq(&a.clone()));
        assert!(!a.raw_eq(&b));
    }

    #[test]
    fn test_value_of_i64_demotion() {
        assert!(matches!(value_of_i64(7), Value::Integer(7)));
        assert!(matches!(value_of_i64(i32::MAX as i64), Value::Integer(_)));
        assert!(matches!(
            value_of_i64(i32::MAX as i64 + 1),
            Value::Number(_)
        ));
        assert!(matches!(
            value_of_i64(i32::MIN as i64 - 1),
            Value::Number(_)
        ));
    }

    #[test]
    fn test_weak_table_drops() {
        let t = Value::table(Table::new(0, 0));
        let w = t.downgrade();
        assert!(w.upgrade().is_some());
        drop(t);
        assert!(w.upgrade().is_none());
    }

    #[test]
    fn test_weak_strong_survives() {
        let v = Value::Integer(9);
        let w = v.downgrade();
        drop(v);
        assert!(matches!(w.upgrade(), Some(Value::Integer(9))));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Nil.type_name(), "nil");
        assert_eq!(Value::Integer(1).type_name(), "number");
        assert_eq!(Value::Number(1.5).type_name(), "number");
        assert_eq!(Value::from("x").type_name(), "string");
        assert_eq!(Value::table(Table::new(0, 0)).type_name(), "table");
    }
}
