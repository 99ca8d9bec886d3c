//! Lua 5.2 pattern matching for find/match/gmatch/gsub.
//!
//! A straight port of the classic recursive matcher. There is no synchronous
//! way to pre-empt a native in mid-flight, so the matcher charges the
//! instruction budget in small chunks as it steps — a pathological pattern
//! suspends or fails like any other runaway loop.

use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::value::{value_of_i64, Value};

const MAX_CAPTURES: usize = 32;
const ESCAPE: u8 = b'%';
/// Matcher steps between budget charges.
const STEPS_PER_CHARGE: u32 = 128;

#[derive(Clone, Copy)]
enum CapLen {
    Position,
    Unclosed,
    Len(usize),
}

#[derive(Clone, Copy)]
struct Capture {
    start: usize,
    len: CapLen,
}

pub struct MatchState<'a, 's> {
    src: &'s [u8],
    pat: &'s [u8],
    captures: Vec<Capture>,
    scope: &'a mut dyn NativeCallScope,
    steps: u32,
}

/// One complete match at or after `init` (byte offset). Anchored patterns
/// try only once.
pub struct MatchResult {
    pub start: usize,
    pub end: usize,
    pub captures: Vec<Value>,
}

pub fn first_match(
    scope: &mut dyn NativeCallScope,
    src: &[u8],
    pat: &[u8],
    init: usize,
) -> LuaResult<Option<MatchResult>> {
    let anchored = pat.first() == Some(&b'^');
    let pstart = if anchored { 1 } else { 0 };
    let mut s = init.min(src.len());
    loop {
        let mut ms = MatchState {
            src,
            pat,
            captures: Vec::new(),
            scope: &mut *scope,
            steps: 0,
        };
        if let Some(end) = ms.do_match(s, pstart)? {
            let captures = ms.capture_values(s, end)?;
            return Ok(Some(MatchResult {
                start: s,
                end,
                captures,
            }));
        }
        if anchored || s >= src.len() {
            return Ok(None);
        }
        s += 1;
    }
}

impl<'a, 's> MatchState<'a, 's> {
    fn tick(&mut self) -> LuaResult<()> {
        self.steps = self.steps.wrapping_add(1);
        if self.steps % STEPS_PER_CHARGE == 0 {
            self.scope.charge(1)?;
        }
        Ok(())
    }

    fn do_match(&mut self, mut s: usize, mut p: usize) -> LuaResult<Option<usize>> {
        loop {
            self.tick()?;
            if p >= self.pat.len() {
                return Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    return if self.pat.get(p + 1) == Some(&b')') {
                        self.capture(s, p + 2, CapLen::Position)
                    } else {
                        self.capture(s, p + 1, CapLen::Unclosed)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    return Ok(if s == self.src.len() { Some(s) } else { None });
                }
                ESCAPE => match self.pat.get(p + 1) {
                    Some(b'b') => return self.match_balance(s, p + 2),
                    Some(b'f') => {
                        p += 2;
                        if self.pat.get(p) != Some(&b'[') {
                            return Err(LuaError::msg("missing '[' after '%f' in pattern"));
                        }
                        let ep = self.class_end(p)?;
                        let prev = if s == 0 { 0 } else { self.src[s - 1] };
                        let cur = if s < self.src.len() { self.src[s] } else { 0 };
                        if !self.match_class_or_set(prev, p, ep)
                            && self.match_class_or_set(cur, p, ep)
                        {
                            p = ep;
                            continue;
                        }
                        return Ok(None);
                    }
                    Some(d @ b'1'..=b'9') => {
                        let idx = (d - b'1') as usize;
                        let (cs, cl) = self.closed_capture(idx)?;
                        let text = &self.src[cs..cs + cl];
                        if self.src.len() >= s + cl && &self.src[s..s + cl] == text {
                            s += cl;
                            p += 2;
                            continue;
                        }
                        return Ok(None);
                    }
                    _ => {}
                },
                _ => {}
            }

            // Default: a single-character class, possibly quantified.
            let ep = self.class_end(p)?;
            let matched = s < self.src.len() && self.match_class_or_set(self.src[s], p, ep);
            match self.pat.get(ep) {
                Some(b'?') => {
                    if matched {
                        if let Some(r) = self.do_match(s + 1, ep + 1)? {
                            return Ok(Some(r));
                        }
                    }
                    p = ep + 1;
                    continue;
                }
                Some(b'+') => {
                    return if matched {
                        self.max_expand(s + 1, p, ep)
                    } else {
                        Ok(None)
                    };
                }
                Some(b'*') => return self.max_expand(s, p, ep),
                Some(b'-') => return self.min_expand(s, p, ep),
                _ => {
                    if matched {
                        s += 1;
                        p = ep;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn capture(&mut self, s: usize, p: usize, what: CapLen) -> LuaResult<Option<usize>> {
        if self.captures.len() >= MAX_CAPTURES {
            return Err(LuaError::msg("too many captures in pattern"));
        }
        self.captures.push(Capture { start: s, len: what });
        let r = self.do_match(s, p)?;
        if r.is_none() {
            self.captures.pop();
        }
        Ok(r)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> LuaResult<Option<usize>> {
        let idx = self
            .captures
            .iter()
            .rposition(|c| matches!(c.len, CapLen::Unclosed))
            .ok_or_else(|| LuaError::msg("invalid pattern capture"))?;
        self.captures[idx].len = CapLen::Len(s - self.captures[idx].start);
        let r = self.do_match(s, p)?;
        if r.is_none() {
            self.captures[idx].len = CapLen::Unclosed;
        }
        Ok(r)
    }

    fn closed_capture(&self, idx: usize) -> LuaResult<(usize, usize)> {
        match self.captures.get(idx) {
            Some(Capture {
                start,
                len: CapLen::Len(l),
            }) => Ok((*start, *l)),
            _ => Err(LuaError::msg("invalid capture index in pattern")),
        }
    }

    fn match_balance(&mut self, s: usize, p: usize) -> LuaResult<Option<usize>> {
        if p + 1 >= self.pat.len() {
            return Err(LuaError::msg("malformed pattern (missing arguments to '%b')"));
        }
        let open = self.pat[p];
        let close = self.pat[p + 1];
        if s >= self.src.len() || self.src[s] != open {
            return Ok(None);
        }
        let mut depth = 1usize;
        let mut i = s + 1;
        while i < self.src.len() {
            self.tick()?;
            if self.src[i] == close {
                depth -= 1;
                if depth == 0 {
                    return self.do_match(i + 1, p + 2);
                }
            } else if self.src[i] == open {
                depth += 1;
            }
            i += 1;
        }
        Ok(None)
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> LuaResult<Option<usize>> {
        let mut count = 0usize;
        while s + count < self.src.len() && self.match_class_or_set(self.src[s + count], p, ep) {
            self.tick()?;
            count += 1;
        }
        loop {
            if let Some(r) = self.do_match(s + count, ep + 1)? {
                return Ok(Some(r));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> LuaResult<Option<usize>> {
        loop {
            if let Some(r) = self.do_match(s, ep + 1)? {
                return Ok(Some(r));
            }
            if s < self.src.len() && self.match_class_or_set(self.src[s], p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    /// Position just past the class element starting at `p`.
    fn class_end(&self, p: usize) -> LuaResult<usize> {
        match self.pat[p] {
            ESCAPE => {
                if p + 1 >= self.pat.len() {
                    Err(LuaError::msg("malformed pattern (ends with '%')"))
                } else {
                    Ok(p + 2)
                }
            }
            b'[' => {
                let mut i = p + 1;
                if self.pat.get(i) == Some(&b'^') {
                    i += 1;
                }
                // A ']' in first position is a literal.
                loop {
                    if i >= self.pat.len() {
                        return Err(LuaError::msg("malformed pattern (missing ']')"));
                    }
                    let c = self.pat[i];
                    i += 1;
                    if c == ESCAPE {
                        i += 1;
                    } else if c == b']' && i > p + 2 {
                        return Ok(i);
                    }
                }
            }
            _ => Ok(p + 1),
        }
    }

    fn match_class_or_set(&self, c: u8, p: usize, ep: usize) -> bool {
        match self.pat[p] {
            ESCAPE => match_class(c, self.pat[p + 1]),
            b'[' => self.match_set(c, p + 1, ep - 1),
            b'.' => true,
            lit => lit == c,
        }
    }

    fn match_set(&self, c: u8, mut p: usize, ep: usize) -> bool {
        let mut negate = false;
        if self.pat.get(p) == Some(&b'^') {
            negate = true;
            p += 1;
        }
        let mut found = false;
        while p < ep {
            if self.pat[p] == ESCAPE && p + 1 < ep {
                if match_class(c, self.pat[p + 1]) {
                    found = true;
                }
                p += 2;
            } else if p + 2 < ep && self.pat[p + 1] == b'-' {
                if self.pat[p] <= c && c <= self.pat[p + 2] {
                    found = true;
                }
                p += 3;
            } else {
                if self.pat[p] == c {
                    found = true;
                }
                p += 1;
            }
        }
        found != negate
    }

    /// Materialise captures: explicit ones as strings/positions, or the
    /// whole match when the pattern had none.
    fn capture_values(&self, start: usize, end: usize) -> LuaResult<Vec<Value>> {
        if self.captures.is_empty() {
            return Ok(vec![Value::Str(LuaStr::new(&self.src[start..end]))]);
        }
        let mut out = Vec::with_capacity(self.captures.len());
        for cap in &self.captures {
            match cap.len {
                CapLen::Position => out.push(value_of_i64(cap.start as i64 + 1)),
                CapLen::Len(l) => {
                    out.push(Value::Str(LuaStr::new(&self.src[cap.start..cap.start + l])))
                }
                CapLen::Unclosed => return Err(LuaError::msg("unfinished capture")),
            }
        }
        Ok(out)
    }
}

fn match_class(c: u8, class: u8) -> bool {
    let res = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => c.is_ascii_whitespace(),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        other => return other == c,
    };
    if class.is_ascii_uppercase() {
        !res
    } else {
        res
    }
}
