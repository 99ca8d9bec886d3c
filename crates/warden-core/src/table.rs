/// Hybrid array+hash table.
///
/// The array part is a 1-based dense region for positive-integer keys; the
/// hash part is a power-of-two node vector with main-position insertion and
/// chained collision slots. Deleting a key clears the value but retains the
/// key in its node, so concurrent `next` walks keep their position until the
/// next rehash reclaims dead slots. `#t` is any border discovered by
/// doubling/binary search, never a cached count.
///
/// Weak-key / weak-value modes store the weak side as `WeakValue`; entries
/// whose weak side died read as nil immediately and are dropped at the next
/// rehash.
use crate::error::{LuaError, LuaResult};
use crate::string::LuaStr;
use crate::value::{Value, WeakValue};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A stored cell: strong by default, weak when the table mode asks for it.
#[derive(Clone)]
enum Slot {
    Strong(Value),
    Weak(WeakValue),
}

impl Slot {
    fn nil() -> Slot {
        Slot::Strong(Value::Nil)
    }

    /// Read the cell; a dead weak reference reads as nil.
    fn get(&self) -> Value {
        match self {
            Slot::Strong(v) => v.clone(),
            Slot::Weak(w) => w.upgrade().unwrap_or(Value::Nil),
        }
    }

    fn is_nil(&self) -> bool {
        match self {
            Slot::Strong(v) => v.is_nil(),
            Slot::Weak(w) => w.upgrade().is_none(),
        }
    }

    fn store(value: Value, weak: bool) -> Slot {
        if weak && value.is_collectible() {
            Slot::Weak(value.downgrade())
        } else {
            Slot::Strong(value)
        }
    }
}

#[derive(Clone)]
struct Node {
    key: Slot,
    key_hash: u32,
    val: Slot,
    /// Chain link to the next node with the same main position, -1 for none.
    next: i32,
}

impl Node {
    fn vacant() -> Node {
        Node {
            key: Slot::nil(),
            key_hash: 0,
            val: Slot::nil(),
            next: -1,
        }
    }

    /// A node is vacant only if it never held a key; dead entries (weak key
    /// collected, or value removed) still occupy their slot.
    fn is_vacant(&self) -> bool {
        matches!(&self.key, Slot::Strong(v) if v.is_nil())
    }

    /// The key if it is still reachable; None for vacant or weak-dead slots.
    fn live_key(&self) -> Option<Value> {
        if self.is_vacant() {
            return None;
        }
        let k = self.key.get();
        if k.is_nil() {
            None
        } else {
            Some(k)
        }
    }
}

pub struct Table {
    array: Vec<Slot>,
    nodes: Vec<Node>,
    /// Downward search hint for free node slots, reset at rehash.
    last_free: usize,
    metatable: Option<TableRef>,
    weak_keys: bool,
    weak_values: bool,
}

impl Table {
    /// Create a table with capacity hints for the array and hash parts.
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        let nnodes = if hash_hint == 0 {
            0
        } else {
            hash_hint.next_power_of_two()
        };
        Table {
            array: Vec::with_capacity(array_hint),
            nodes: vec![Node::vacant(); nnodes],
            last_free: nnodes,
            metatable: None,
            weak_keys: false,
            weak_values: false,
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }

    /// Switch weak-key / weak-value modes, converting existing cells.
    pub fn set_mode(&mut self, weak_keys: bool, weak_values: bool) {
        self.weak_keys = weak_keys;
        self.weak_values = weak_values;
        for slot in &mut self.array {
            *slot = Slot::store(slot.get(), weak_values);
        }
        for node in &mut self.nodes {
            if node.is_vacant() {
                continue;
            }
            node.key = Slot::store(node.key.get(), weak_keys);
            node.val = Slot::store(node.val.get(), weak_values);
        }
    }

    // ---- Raw access ----

    /// Raw get, no metamethods.
    pub fn raw_get(&self, key: &Value) -> Value {
        let key = normalize_key(key);
        if let Value::Integer(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[(i - 1) as usize].get();
            }
        }
        if key.is_nil() {
            return Value::Nil;
        }
        self.hash_get(&key)
    }

    pub fn raw_get_int(&self, i: i64) -> Value {
        if i >= 1 && i <= self.array.len() as i64 {
            return self.array[(i - 1) as usize].get();
        }
        self.hash_get(&int_key(i))
    }

    pub fn raw_get_str(&self, key: &LuaStr) -> Value {
        self.hash_get(&Value::Str(key.clone()))
    }

    /// Raw set, no metamethods. Rejects nil and NaN keys.
    pub fn raw_set(&mut self, key: Value, value: Value) -> LuaResult<()> {
        let key = normalize_key(&key);
        match &key {
            Value::Nil => return Err(LuaError::msg("table index is nil")),
            Value::Number(f) if f.is_nan() => {
                return Err(LuaError::msg("table index is NaN"))
            }
            _ => {}
        }
        if let Value::Integer(i) = key {
            if self.try_array_set(i, &value) {
                return Ok(());
            }
        }
        self.hash_set(key, value);
        Ok(())
    }

    pub fn raw_set_int(&mut self, i: i64, value: Value) {
        if i >= 1 && i <= i32::MAX as i64 && self.try_array_set(i as i32, &value) {
            return;
        }
        self.hash_set(int_key(i), value);
    }

    pub fn raw_set_str(&mut self, key: &LuaStr, value: Value) {
        self.hash_set(Value::Str(key.clone()), value);
    }

    /// Array fast path: store in range, or append at the border and migrate
    /// any now-contiguous integer keys out of the hash part.
    fn try_array_set(&mut self, i: i32, value: &Value) -> bool {
        if i < 1 {
            return false;
        }
        let idx = (i - 1) as usize;
        if idx < self.array.len() {
            self.array[idx] = Slot::store(value.clone(), self.weak_values);
            return true;
        }
        if idx == self.array.len() {
            if value.is_nil() {
                // The hash part may still hold this key (a rehash can leave
                // the border key there); let the hash path clear it.
                return false;
            }
            self.array.push(Slot::store(value.clone(), self.weak_values));
            self.migrate_hash_prefix();
            return true;
        }
        false
    }

    /// Pull successive integer keys from the hash part into the array.
    fn migrate_hash_prefix(&mut self) {
        loop {
            let next_key = int_key(self.array.len() as i64 + 1);
            let v = self.hash_take(&next_key);
            if v.is_nil() {
                break;
            }
            self.array.push(Slot::store(v, self.weak_values));
        }
    }

    // ---- Hash part ----

    fn main_position(&self, hash: u32) -> usize {
        debug_assert!(self.nodes.len().is_power_of_two());
        (hash as usize) & (self.nodes.len() - 1)
    }

    /// Find the node index holding `key`, matching dead keys too (they anchor
    /// iteration).
    fn find_node(&self, key: &Value, hash: u32) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut idx = self.main_position(hash) as i32;
        loop {
            let node = &self.nodes[idx as usize];
            if !node.is_vacant() && node.key_hash == hash {
                if let Some(k) = node.live_key() {
                    if k.raw_eq(key) {
                        return Some(idx as usize);
                    }
                }
            }
            idx = node.next;
            if idx < 0 {
                return None;
            }
        }
    }

    fn hash_get(&self, key: &Value) -> Value {
        match self.find_node(key, key_hash(key)) {
            Some(i) => self.nodes[i].val.get(),
            None => Value::Nil,
        }
    }

    /// Remove a key from the hash part, returning its previous value. The
    /// key stays in its slot as a dead entry.
    fn hash_take(&mut self, key: &Value) -> Value {
        match self.find_node(key, key_hash(key)) {
            Some(i) => {
                let old = self.nodes[i].val.get();
                self.nodes[i].val = Slot::nil();
                old
            }
            None => Value::Nil,
        }
    }

    fn hash_set(&mut self, key: Value, value: Value) {
        let hash = key_hash(&key);
        if let Some(i) = self.find_node(&key, hash) {
            // Setting nil clears the value but keeps the key (dead slot).
            self.nodes[i].val = Slot::store(value, self.weak_values);
            return;
        }
        if value.is_nil() {
            return;
        }
        loop {
            if self.try_insert(&key, hash, &value) {
                return;
            }
            self.rehash(Some(&key));
            // The rehash may have grown the array over this key.
            if let Value::Integer(i) = key {
                if self.try_array_set(i, &value) {
                    return;
                }
            }
        }
    }

    /// Place a new key in the hash part; false when there is no room.
    fn try_insert(&mut self, key: &Value, hash: u32, value: &Value) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        let mp = self.main_position(hash);
        if self.nodes[mp].is_vacant() {
            self.nodes[mp] = Node {
                key: Slot::store(key.clone(), self.weak_keys),
                key_hash: hash,
                val: Slot::store(value.clone(), self.weak_values),
                next: -1,
            };
            return true;
        }
        let Some(free) = self.free_node() else {
            return false;
        };
        let colliding_mp = self.main_position(self.nodes[mp].key_hash);
        if colliding_mp != mp {
            // The occupant is a chain member displaced from elsewhere:
            // move it to the free slot and take its place.
            let mut prev = colliding_mp;
            while self.nodes[prev].next != mp as i32 {
                prev = self.nodes[prev].next as usize;
            }
            self.nodes[prev].next = free as i32;
            self.nodes[free] = self.nodes[mp].clone();
            self.nodes[mp] = Node {
                key: Slot::store(key.clone(), self.weak_keys),
                key_hash: hash,
                val: Slot::store(value.clone(), self.weak_values),
                next: -1,
            };
        } else {
            // The occupant owns this main position: chain the new key after
            // it from the free slot.
            self.nodes[free] = Node {
                key: Slot::store(key.clone(), self.weak_keys),
                key_hash: hash,
                val: Slot::store(value.clone(), self.weak_values),
                next: self.nodes[mp].next,
            };
            self.nodes[mp].next = free as i32;
        }
        true
    }

    fn free_node(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].is_vacant() {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Rebuild both parts: the new array size is the largest power of two
    /// that is at least half occupied by integer keys, everything else goes
    /// to a freshly sized hash part. Dead entries (removed values, collected
    /// weak references) are dropped here.
    fn rehash(&mut self, extra: Option<&Value>) {
        let mut entries: Vec<(Value, Value)> = Vec::new();
        for (i, slot) in self.array.iter().enumerate() {
            let v = slot.get();
            if !v.is_nil() {
                entries.push((Value::Integer((i + 1) as i32), v));
            }
        }
        for node in &self.nodes {
            if let Some(k) = node.live_key() {
                let v = node.val.get();
                if !v.is_nil() {
                    entries.push((k, v));
                }
            }
        }

        // Integer keys grouped by log2 bucket: bucket b covers (2^(b-1), 2^b].
        let mut nums = [0usize; 32];
        let mut int_total = 0usize;
        let mut count_key = |k: &Value| {
            if let Value::Integer(i) = k {
                if *i >= 1 {
                    nums[ceil_log2(*i as u32) as usize] += 1;
                    int_total += 1;
                }
            }
        };
        for (k, _) in &entries {
            count_key(k);
        }
        if let Some(k) = extra {
            count_key(k);
        }

        let mut best_size = 0usize;
        let mut na = 0usize;
        let mut size = 1usize;
        for bucket in nums.iter().take(31) {
            na += bucket;
            if na > size / 2 {
                best_size = size;
            }
            if na == int_total {
                break;
            }
            size *= 2;
        }

        let to_hash = entries
            .iter()
            .filter(|(k, _)| !matches!(k, Value::Integer(i) if *i >= 1 && (*i as usize) <= best_size))
            .count();
        let extra_to_hash = match extra {
            Some(Value::Integer(i)) if *i >= 1 && (*i as usize) <= best_size => 0,
            Some(_) => 1,
            None => 0,
        };
        let nnodes = match to_hash + extra_to_hash {
            0 => 0,
            n => n.next_power_of_two(),
        };

        self.array = vec![Slot::nil(); best_size];
        self.nodes = vec![Node::vacant(); nnodes];
        self.last_free = nnodes;

        for (k, v) in entries {
            match k {
                Value::Integer(i) if i >= 1 && (i as usize) <= best_size => {
                    self.array[(i - 1) as usize] = Slot::store(v, self.weak_values);
                }
                k => {
                    let hash = key_hash(&k);
                    let placed = self.try_insert(&k, hash, &v);
                    debug_assert!(placed, "rehash sized the node table for all entries");
                }
            }
        }
    }

    // ---- Length ----

    /// Any border: an index n with t[n] non-nil and t[n+1] nil.
    pub fn length(&self) -> i64 {
        let alen = self.array.len();
        if alen > 0 && self.array[alen - 1].is_nil() {
            // A border exists inside the array part; binary search for it.
            let mut lo = 0usize; // t[lo] known non-nil (t[0] virtually)
            let mut hi = alen; // t[hi] known nil
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo as i64;
        }
        if self.nodes.is_empty() {
            return alen as i64;
        }
        // Array part is full; the border may continue into the hash part.
        // Doubling search for a nil, then binary search for the border.
        let mut i = alen as i64;
        let mut j = i + 1;
        while !self.raw_get_int(j).is_nil() {
            i = j;
            if j > (i32::MAX / 2) as i64 {
                let mut k = alen as i64 + 1;
                while !self.raw_get_int(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let mid = (i + j) / 2;
            if self.raw_get_int(mid).is_nil() {
                j = mid;
            } else {
                i = mid;
            }
        }
        i
    }

    // ---- Iteration ----

    /// Next live pair after `key`; nil starts the walk. Err for a key that
    /// was never in the table.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, ()> {
        let start = self.iter_position(key)?;
        for i in start..self.array.len() {
            let v = self.array[i].get();
            if !v.is_nil() {
                return Ok(Some((Value::Integer((i + 1) as i32), v)));
            }
        }
        let nstart = start.saturating_sub(self.array.len());
        for n in nstart..self.nodes.len() {
            if let Some(k) = self.nodes[n].live_key() {
                let v = self.nodes[n].val.get();
                if !v.is_nil() {
                    return Ok(Some((k, v)));
                }
            }
        }
        Ok(None)
    }

    /// Scan position immediately after `key`: array indices map to 0..alen,
    /// node indices follow.
    fn iter_position(&self, key: &Value) -> Result<usize, ()> {
        if key.is_nil() {
            return Ok(0);
        }
        let key = normalize_key(key);
        if let Value::Integer(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                return Ok(i as usize);
            }
        }
        match self.find_node(&key, key_hash(&key)) {
            Some(n) => Ok(self.array.len() + n + 1),
            None => Err(()),
        }
    }

    /// Live values of both parts, for the memory walker.
    pub fn live_values(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for slot in &self.array {
            let v = slot.get();
            if !v.is_nil() {
                out.push(v);
            }
        }
        for node in &self.nodes {
            if node.live_key().is_some() {
                let v = node.val.get();
                if !v.is_nil() {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Live pair count (walks both parts; not cached by design).
    pub fn live_len(&self) -> usize {
        self.live_values().len()
    }
}

/// Integral Number keys collapse onto Integer keys so `t[2]` and `t[2.0]`
/// address the same slot.
fn normalize_key(key: &Value) -> Value {
    match key {
        Value::Number(f)
            if f.fract() == 0.0 && *f >= i32::MIN as f64 && *f <= i32::MAX as f64 =>
        {
            Value::Integer(*f as i32)
        }
        other => other.clone(),
    }
}

fn int_key(i: i64) -> Value {
    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
        Value::Integer(i as i32)
    } else {
        Value::Number(i as f64)
    }
}

fn key_hash(key: &Value) -> u32 {
    match key {
        Value::Nil => 0,
        Value::Boolean(b) => {
            if *b {
                1
            } else {
                2
            }
        }
        Value::Integer(i) => mix(*i as u32),
        Value::Number(f) => {
            let bits = f.to_bits();
            mix((bits ^ (bits >> 32)) as u32)
        }
        Value::Str(s) => s.hash_code(),
        other => mix(other.heap_id().unwrap_or(0) as u32),
    }
}

/// Cheap avalanche so sequential integers and aligned pointers spread.
fn mix(mut h: u32) -> u32 {
    h = h.wrapping_mul(0x9e37_79b9);
    h ^ (h >> 16)
}

/// ceil(log2(i)) for i >= 1.
fn ceil_log2(i: u32) -> u32 {
    32 - (i - 1).leading_zeros()
}

/// Shared handle to a table. The interior lock is narrow: every operation
/// releases it before any callback can re-enter the interpreter.
#[derive(Clone)]
pub struct TableRef(Arc<Mutex<Table>>);

impl TableRef {
    pub fn new(t: Table) -> Self {
        TableRef(Arc::new(Mutex::new(t)))
    }

    pub fn from_arc(arc: Arc<Mutex<Table>>) -> Self {
        TableRef(arc)
    }

    pub fn downgrade(&self) -> Weak<Mutex<Table>> {
        Arc::downgrade(&self.0)
    }

    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn get(&self, key: &Value) -> Value {
        self.0.lock().raw_get(key)
    }

    pub fn set(&self, key: Value, value: Value) -> LuaResult<()> {
        self.0.lock().raw_set(key, value)
    }

    pub fn get_int(&self, i: i64) -> Value {
        self.0.lock().raw_get_int(i)
    }

    pub fn set_int(&self, i: i64, value: Value) {
        self.0.lock().raw_set_int(i, value)
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.0.lock().raw_get_str(&LuaStr::from(key))
    }

    pub fn set_str(&self, key: &str, value: Value) {
        self.0.lock().raw_set_str(&LuaStr::from(key), value)
    }

    pub fn get_lstr(&self, key: &LuaStr) -> Value {
        self.0.lock().raw_get_str(key)
    }

    pub fn set_lstr(&self, key: &LuaStr, value: Value) {
        self.0.lock().raw_set_str(key, value)
    }

    pub fn length(&self) -> i64 {
        self.0.lock().length()
    }

    pub fn next(&self, key: &Value) -> LuaResult<Option<(Value, Value)>> {
        self.0
            .lock()
            .next(key)
            .map_err(|()| LuaError::msg("invalid key to 'next'"))
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.0.lock().metatable()
    }

    pub fn set_metatable(&self, mt: Option<TableRef>) {
        self.0.lock().set_metatable(mt);
    }

    pub fn set_mode(&self, weak_keys: bool, weak_values: bool) {
        self.0.lock().set_mode(weak_keys, weak_values);
    }

    pub fn with<R>(&self, f: impl FnOnce(&Table) -> R) -> R {
        f(&self.0.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        f(&mut self.0.lock())
    }
}
