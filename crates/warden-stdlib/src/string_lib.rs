//! String library. Construction-heavy entry points (`rep`, `format`, `gsub`)
//! check the per-context string-size cap before materialising results.

use crate::pattern::{self, MatchResult};
use crate::{arg_error, check_int, check_str, opt_int, register_fn};
use parking_lot::Mutex;
use std::sync::Arc;
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::{Table, TableRef};
use warden_core::value::{value_of_i64, NativeFunction, Value};
use warden_vm::metamethod::{set_class_metatable, ValueClass, MM_INDEX};
use warden_vm::{coerce, Globals};

pub fn register(globals: &Arc<Globals>) {
    let t = TableRef::new(Table::new(0, 16));
    register_fn(&t, "len", native_len);
    register_fn(&t, "sub", native_sub);
    register_fn(&t, "upper", native_upper);
    register_fn(&t, "lower", native_lower);
    register_fn(&t, "rep", native_rep);
    register_fn(&t, "reverse", native_reverse);
    register_fn(&t, "byte", native_byte);
    register_fn(&t, "char", native_char);
    register_fn(&t, "format", native_format);
    register_fn(&t, "find", native_find);
    register_fn(&t, "match", native_match);
    register_fn(&t, "gmatch", native_gmatch);
    register_fn(&t, "gsub", native_gsub);
    globals.env().set_str("string", Value::Table(t.clone()));

    // `("x"):upper()` works through the string class metatable.
    let mt = TableRef::new(Table::new(0, 1));
    mt.set_str(MM_INDEX, Value::Table(t));
    set_class_metatable(ValueClass::Str, Some(mt));
}

/// Translate a 1-based (possibly negative) string index to a byte offset.
fn str_index(i: i64, len: usize) -> i64 {
    if i >= 0 {
        i
    } else {
        len as i64 + i + 1
    }
}

fn native_len(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "len")?;
    Ok(vec![value_of_i64(s.len() as i64)])
}

fn native_sub(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "sub")?;
    let len = s.len();
    let mut i = str_index(opt_int(args, 1, "sub", 1)?, len);
    let mut j = str_index(opt_int(args, 2, "sub", -1)?, len);
    if i < 1 {
        i = 1;
    }
    if j > len as i64 {
        j = len as i64;
    }
    if i > j {
        return Ok(vec![Value::from("")]);
    }
    Ok(vec![Value::Str(LuaStr::new(
        &s.as_bytes()[(i - 1) as usize..j as usize],
    ))])
}

fn native_upper(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "upper")?;
    Ok(vec![Value::Str(LuaStr::from_vec(
        s.as_bytes().to_ascii_uppercase(),
    ))])
}

fn native_lower(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "lower")?;
    Ok(vec![Value::Str(LuaStr::from_vec(
        s.as_bytes().to_ascii_lowercase(),
    ))])
}

fn native_rep(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "rep")?;
    let n = check_int(args, 1, "rep")?;
    if n <= 0 {
        return Ok(vec![Value::from("")]);
    }
    let total = s.len().saturating_mul(n as usize);
    scope.check_string_len(total)?;
    let mut buf = Vec::with_capacity(total);
    for _ in 0..n {
        scope.charge(1)?;
        buf.extend_from_slice(s.as_bytes());
    }
    Ok(vec![Value::Str(LuaStr::from_vec(buf))])
}

fn native_reverse(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "reverse")?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.reverse();
    Ok(vec![Value::Str(LuaStr::from_vec(bytes))])
}

fn native_byte(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "byte")?;
    let len = s.len();
    let i = str_index(opt_int(args, 1, "byte", 1)?, len).max(1);
    let j = str_index(opt_int(args, 2, "byte", i)?, len).min(len as i64);
    let mut out = Vec::new();
    let mut k = i;
    while k <= j {
        out.push(Value::Integer(s.as_bytes()[(k - 1) as usize] as i32));
        k += 1;
    }
    Ok(out)
}

fn native_char(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let mut bytes = Vec::with_capacity(args.len());
    for (i, v) in args.iter().enumerate() {
        let c = coerce::to_integer(v).ok_or_else(|| arg_error(i, "char", "number", v))?;
        if !(0..=255).contains(&c) {
            return Err(LuaError::msg(format!(
                "bad argument #{} to 'char' (value out of range)",
                i + 1
            )));
        }
        bytes.push(c as u8);
    }
    Ok(vec![Value::Str(LuaStr::from_vec(bytes))])
}

fn native_format(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let fmt = check_str(args, 0, "format")?;
    let fmt = fmt.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut arg_idx = 1usize;
    let mut i = 0usize;
    while i < fmt.len() {
        if fmt[i] != b'%' {
            out.push(fmt[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= fmt.len() {
            return Err(LuaError::msg("invalid format string to 'format'"));
        }
        if fmt[i] == b'%' {
            out.push(b'%');
            i += 1;
            continue;
        }
        // Flags, width and precision are collected verbatim.
        let spec_start = i;
        while i < fmt.len() && matches!(fmt[i], b'-' | b'+' | b' ' | b'#' | b'0') {
            i += 1;
        }
        while i < fmt.len() && fmt[i].is_ascii_digit() {
            i += 1;
        }
        if i < fmt.len() && fmt[i] == b'.' {
            i += 1;
            while i < fmt.len() && fmt[i].is_ascii_digit() {
                i += 1;
            }
        }
        if i >= fmt.len() {
            return Err(LuaError::msg("invalid format string to 'format'"));
        }
        let conv = fmt[i];
        let spec = std::str::from_utf8(&fmt[spec_start..i]).unwrap_or("");
        i += 1;

        let piece = format_one(scope, conv, spec, args, &mut arg_idx)?;
        scope.check_string_len(out.len() + piece.len())?;
        out.extend_from_slice(&piece);
    }
    scope.check_string_len(out.len())?;
    Ok(vec![Value::Str(LuaStr::from_vec(out))])
}

fn format_one(
    scope: &mut dyn NativeCallScope,
    conv: u8,
    spec: &str,
    args: &[Value],
    arg_idx: &mut usize,
) -> LuaResult<Vec<u8>> {
    let take = |arg_idx: &mut usize| -> Value {
        let v = args.get(*arg_idx).cloned().unwrap_or(Value::Nil);
        *arg_idx += 1;
        v
    };
    let (width, zero_pad, left_align, precision) = parse_spec(spec);
    let pad = |mut text: String| -> Vec<u8> {
        if text.len() < width {
            let fill = width - text.len();
            if left_align {
                text.push_str(&" ".repeat(fill));
            } else if zero_pad {
                let negative = text.starts_with('-');
                if negative {
                    text = format!("-{}{}", "0".repeat(fill), &text[1..]);
                } else {
                    text = format!("{}{}", "0".repeat(fill), text);
                }
            } else {
                text = format!("{}{}", " ".repeat(fill), text);
            }
        }
        text.into_bytes()
    };

    match conv {
        b'd' | b'i' => {
            let v = take(arg_idx);
            let n = coerce::to_integer(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(pad(n.to_string()))
        }
        b'u' => {
            let v = take(arg_idx);
            let n = coerce::to_integer(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(pad((n as u64).to_string()))
        }
        b'x' => {
            let v = take(arg_idx);
            let n = coerce::to_integer(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(pad(format!("{:x}", n)))
        }
        b'X' => {
            let v = take(arg_idx);
            let n = coerce::to_integer(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(pad(format!("{:X}", n)))
        }
        b'o' => {
            let v = take(arg_idx);
            let n = coerce::to_integer(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(pad(format!("{:o}", n)))
        }
        b'c' => {
            let v = take(arg_idx);
            let n = coerce::to_integer(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(vec![n as u8])
        }
        b'f' | b'F' => {
            let v = take(arg_idx);
            let n = coerce::to_number(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            let prec = precision.unwrap_or(6);
            Ok(pad(format!("{:.*}", prec, n)))
        }
        b'e' | b'E' => {
            let v = take(arg_idx);
            let n = coerce::to_number(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            let prec = precision.unwrap_or(6);
            let s = format!("{:.*e}", prec, n);
            Ok(pad(if conv == b'E' { s.to_uppercase() } else { s }))
        }
        b'g' | b'G' => {
            let v = take(arg_idx);
            let n = coerce::to_number(&v)
                .ok_or_else(|| arg_error(*arg_idx - 1, "format", "number", &v))?;
            Ok(pad(coerce::number_to_string(n)))
        }
        b's' => {
            let v = take(arg_idx);
            let s = scope.tostring_value(&v)?;
            let mut text = s.to_lossy();
            if let Some(p) = precision {
                text.truncate(p);
            }
            Ok(pad(text))
        }
        b'q' => {
            let v = take(arg_idx);
            let s = scope.tostring_value(&v)?;
            let mut out = vec![b'"'];
            for &b in s.as_bytes() {
                match b {
                    b'"' => out.extend_from_slice(b"\\\""),
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    0 => out.extend_from_slice(b"\\0"),
                    other => out.push(other),
                }
            }
            out.push(b'"');
            Ok(out)
        }
        other => Err(LuaError::msg(format!(
            "invalid option '%{}' to 'format'",
            other as char
        ))),
    }
}

fn parse_spec(spec: &str) -> (usize, bool, bool, Option<usize>) {
    let mut width = 0usize;
    let mut zero_pad = false;
    let mut left_align = false;
    let mut precision = None;
    let mut rest = spec;
    while let Some(c) = rest.chars().next() {
        match c {
            '-' => left_align = true,
            '0' => {
                zero_pad = true;
            }
            '+' | ' ' | '#' => {}
            _ => break,
        }
        rest = &rest[1..];
    }
    let (w, p) = match rest.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (rest, None),
    };
    if let Ok(n) = w.parse::<usize>() {
        width = n.min(99);
    }
    if let Some(p) = p {
        precision = p.parse::<usize>().ok().map(|n| n.min(99));
    }
    (width, zero_pad, left_align, precision)
}

// ---- Pattern entry points ----

fn native_find(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "find")?;
    let pat = check_str(args, 1, "find")?;
    let init = find_init(opt_int(args, 2, "find", 1)?, s.len());
    let plain = args.get(3).map(|v| v.is_truthy()).unwrap_or(false);

    if plain {
        let hay = &s.as_bytes()[init.min(s.len())..];
        if pat.is_empty() {
            return Ok(vec![
                value_of_i64(init as i64 + 1),
                value_of_i64(init as i64),
            ]);
        }
        return Ok(match find_plain(hay, pat.as_bytes()) {
            Some(offset) => vec![
                value_of_i64((init + offset) as i64 + 1),
                value_of_i64((init + offset + pat.len()) as i64),
            ],
            None => vec![Value::Nil],
        });
    }

    match pattern::first_match(scope, s.as_bytes(), pat.as_bytes(), init)? {
        Some(MatchResult {
            start,
            end,
            captures,
        }) => {
            let mut out = vec![value_of_i64(start as i64 + 1), value_of_i64(end as i64)];
            // With explicit captures they follow the indices.
            if captures.len() > 1 || has_explicit_captures(pat.as_bytes()) {
                out.extend(captures);
            }
            Ok(out)
        }
        None => Ok(vec![Value::Nil]),
    }
}

fn has_explicit_captures(pat: &[u8]) -> bool {
    let mut i = 0;
    while i < pat.len() {
        match pat[i] {
            b'%' => i += 2,
            b'(' => return true,
            _ => i += 1,
        }
    }
    false
}

fn find_plain(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| &hay[i..i + needle.len()] == needle)
}

fn find_init(i: i64, len: usize) -> usize {
    let idx = str_index(i, len);
    if idx < 1 {
        0
    } else {
        (idx - 1) as usize
    }
}

fn native_match(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "match")?;
    let pat = check_str(args, 1, "match")?;
    let init = find_init(opt_int(args, 2, "match", 1)?, s.len());
    match pattern::first_match(scope, s.as_bytes(), pat.as_bytes(), init)? {
        Some(m) => Ok(m.captures),
        None => Ok(vec![Value::Nil]),
    }
}

fn native_gmatch(_scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "gmatch")?;
    let pat = check_str(args, 1, "gmatch")?;
    let pos = Arc::new(Mutex::new(0usize));
    let iter = NativeFunction::new("gmatch_iterator", move |scope, _args: &[Value]| {
        let mut cursor = pos.lock();
        if *cursor > s.len() {
            return Ok(vec![Value::Nil]);
        }
        match pattern::first_match(scope, s.as_bytes(), pat.as_bytes(), *cursor)? {
            Some(m) => {
                // Empty matches still advance the scan.
                *cursor = if m.end > *cursor { m.end } else { *cursor + 1 };
                Ok(m.captures)
            }
            None => {
                *cursor = s.len() + 1;
                Ok(vec![Value::Nil])
            }
        }
    });
    Ok(vec![Value::native(iter)])
}

fn native_gsub(scope: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let s = check_str(args, 0, "gsub")?;
    let pat = check_str(args, 1, "gsub")?;
    let repl = args.get(2).cloned().unwrap_or(Value::Nil);
    let max_n = opt_int(args, 3, "gsub", i64::MAX)?;

    let src = s.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    let mut count: i64 = 0;

    while count < max_n && pos <= src.len() {
        let Some(m) = pattern::first_match(scope, src, pat.as_bytes(), pos)? else {
            break;
        };
        count += 1;
        scope.check_string_len(out.len() + (m.start - pos))?;
        out.extend_from_slice(&src[pos..m.start]);
        let whole = &src[m.start..m.end];
        let replaced = apply_replacement(scope, &repl, whole, &m.captures)?;
        scope.check_string_len(out.len() + replaced.len())?;
        out.extend_from_slice(&replaced);
        if m.end > pos {
            pos = m.end;
        } else {
            // Empty match: emit the skipped byte and move on.
            if pos < src.len() {
                out.push(src[pos]);
            }
            pos += 1;
        }
    }
    if pos <= src.len() {
        scope.check_string_len(out.len() + (src.len() - pos))?;
        out.extend_from_slice(&src[pos..]);
    }
    Ok(vec![Value::Str(LuaStr::from_vec(out)), value_of_i64(count)])
}

fn apply_replacement(
    scope: &mut dyn NativeCallScope,
    repl: &Value,
    whole: &[u8],
    captures: &[Value],
) -> LuaResult<Vec<u8>> {
    let capture_at = |i: usize| -> Value {
        captures.get(i).cloned().unwrap_or(Value::Nil)
    };
    match repl {
        Value::Str(template) => {
            let t = template.as_bytes();
            let mut out = Vec::new();
            let mut i = 0;
            while i < t.len() {
                if t[i] == b'%' && i + 1 < t.len() {
                    match t[i + 1] {
                        b'%' => out.push(b'%'),
                        b'0' => out.extend_from_slice(whole),
                        d @ b'1'..=b'9' => {
                            let v = capture_at((d - b'1') as usize);
                            match coerce::to_concat_bytes(&v) {
                                Some(bytes) => out.extend_from_slice(&bytes),
                                None => {
                                    return Err(LuaError::msg(
                                        "invalid capture index in replacement string",
                                    ))
                                }
                            }
                        }
                        other => {
                            return Err(LuaError::msg(format!(
                                "invalid use of '%{}' in replacement string",
                                other as char
                            )))
                        }
                    }
                    i += 2;
                } else {
                    out.push(t[i]);
                    i += 1;
                }
            }
            Ok(out)
        }
        Value::Table(t) => {
            let v = t.get(&capture_at(0));
            replacement_value(v, whole)
        }
        Value::Function(_) => {
            let r = scope.call_value(repl, captures)?;
            replacement_value(r.into_iter().next().unwrap_or(Value::Nil), whole)
        }
        Value::Integer(_) | Value::Number(_) => {
            Ok(coerce::tostring_basic(repl).as_bytes().to_vec())
        }
        other => Err(arg_error(2, "gsub", "string/function/table", other)),
    }
}

/// A falsy replacement keeps the original match.
fn replacement_value(v: Value, whole: &[u8]) -> LuaResult<Vec<u8>> {
    if v.is_falsy() {
        return Ok(whole.to_vec());
    }
    coerce::to_concat_bytes(&v)
        .ok_or_else(|| LuaError::msg("invalid replacement value (a table or function)"))
}
