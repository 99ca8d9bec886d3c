/// Reachable-memory estimator.
///
/// A DFS over values with a pointer-identity visited set; cycles terminate,
/// equal-but-distinct values are counted separately. The weights are part of
/// the host contract — hosts admission-control on the number — so changing
/// them is a visible behaviour change. This is an estimator, not a collector:
/// nothing is enforced here.
use crate::proto::Constant;
use crate::value::{Function, Upvalue, Value};
use rustc_hash::FxHashSet;

/// Flat weight of a registered host callable.
const NATIVE_FN_WEIGHT: usize = 10;

/// Estimate the bytes reachable from `root`.
pub fn reachable_bytes(root: &Value) -> usize {
    let mut walker = Walker {
        visited: FxHashSet::default(),
    };
    walker.weigh(root)
}

struct Walker {
    visited: FxHashSet<usize>,
}

impl Walker {
    /// Pointer-identity guard: true the first time a heap value is seen.
    fn first_visit(&mut self, value: &Value) -> bool {
        match value.heap_id() {
            Some(id) => self.visited.insert(id),
            None => true,
        }
    }

    fn weigh(&mut self, value: &Value) -> usize {
        if !self.first_visit(value) {
            return 0;
        }
        match value {
            Value::Nil => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 4,
            Value::Number(_) => 8,
            Value::Str(s) => s.len(),
            Value::Table(t) => {
                // Keys are not independently charged; their storage is
                // amortised into the slot.
                let children = t.with(|tbl| tbl.live_values());
                children.iter().map(|v| self.weigh(v)).sum()
            }
            Value::Function(Function::Native(_)) => NATIVE_FN_WEIGHT,
            Value::Function(Function::Lua(closure)) => {
                let mut size = 0;
                for cell in &closure.upvalues {
                    let inner = cell.lock().clone();
                    if let Upvalue::Closed(v) = inner {
                        size += self.weigh(&v);
                    }
                    // Open cells live in an executing stack; that stack is
                    // reached through the owning thread, not through us.
                }
                for k in &closure.proto.constants {
                    size += self.weigh_constant(k);
                }
                size += closure.proto.code.len() * 4;
                size += self.weigh(&Value::Table(closure.globals.clone()));
                size
            }
            Value::Thread(t) => {
                let mut size = self.weigh(&t.state.function);
                for v in t.state.pending_values() {
                    size += self.weigh(&v);
                }
                size
            }
            // Opaque host payload: reported as 0 by this walker.
            Value::Userdata(_) => 0,
        }
    }

    fn weigh_constant(&mut self, k: &Constant) -> usize {
        self.weigh(&k.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string::LuaStr;
    use crate::table::{Table, TableRef};

    #[test]
    fn test_scalar_weights() {
        assert_eq!(reachable_bytes(&Value::Nil), 0);
        assert_eq!(reachable_bytes(&Value::Boolean(true)), 1);
        assert_eq!(reachable_bytes(&Value::Integer(1)), 4);
        assert_eq!(reachable_bytes(&Value::Number(1.0)), 8);
    }

    #[test]
    fn test_string_weight_is_byte_length() {
        let s = Value::Str(LuaStr::new(&vec![b'x'; 77]));
        assert_eq!(reachable_bytes(&s), 77);
    }

    #[test]
    fn test_table_sums_both_parts() {
        let t = TableRef::new(Table::new(0, 0));
        t.set_int(1, Value::Integer(1)); // 4
        t.set_int(2, Value::Number(0.5)); // 8
        t.set_str("name", Value::Str(LuaStr::new(b"abcde"))); // 5
        assert_eq!(reachable_bytes(&Value::Table(t)), 17);
    }

    #[test]
    fn test_cycles_terminate() {
        let t = TableRef::new(Table::new(0, 0));
        t.set_str("self", Value::Table(t.clone()));
        t.set_str("n", Value::Integer(0));
        assert_eq!(reachable_bytes(&Value::Table(t)), 4);
    }

    #[test]
    fn test_shared_value_counted_once() {
        let shared = Value::Str(LuaStr::new(&vec![b'q'; 100]));
        let t = TableRef::new(Table::new(0, 0));
        t.set_int(1, shared.clone());
        t.set_int(2, shared.clone());
        assert_eq!(reachable_bytes(&Value::Table(t)), 100);
    }

    #[test]
    fn test_equal_but_distinct_strings_both_counted() {
        // Long strings bypass the recent cache, so these are two allocations.
        let bytes = vec![b'z'; 64];
        let t = TableRef::new(Table::new(0, 0));
        t.set_int(1, Value::Str(LuaStr::new(&bytes)));
        t.set_int(2, Value::Str(LuaStr::new(&bytes)));
        assert_eq!(reachable_bytes(&Value::Table(t)), 128);
    }
}
