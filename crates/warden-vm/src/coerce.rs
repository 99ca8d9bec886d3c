//! Implicit coercions between numbers and strings.

use warden_core::string::LuaStr;
use warden_core::value::Value;

/// Numeric view of a value: integers widen, strings that parse as numbers
/// participate as Numbers.
pub fn to_number(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(f) => Some(*f),
        Value::Str(s) => str_to_number(s.as_bytes()),
        _ => None,
    }
}

/// Parse a numeric string the way the language does: optional surrounding
/// whitespace, optional sign, decimal or `0x` hexadecimal.
pub fn str_to_number(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        let mut acc: f64 = 0.0;
        for c in hex.bytes() {
            let d = match c {
                b'0'..=b'9' => (c - b'0') as f64,
                b'a'..=b'f' => (c - b'a' + 10) as f64,
                b'A'..=b'F' => (c - b'A' + 10) as f64,
                _ => return None,
            };
            acc = acc * 16.0 + d;
        }
        acc
    } else {
        body.parse::<f64>().ok()?
    };
    Some(if neg { -value } else { value })
}

/// Integer view for argument checking: integers, integral doubles, and
/// strings holding either.
pub fn to_integer(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(*i as i64),
        Value::Number(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        Value::Str(s) => {
            let f = str_to_number(s.as_bytes())?;
            if f.fract() == 0.0 && f.is_finite() {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Double formatting: integral values print without a fraction, everything
/// else uses the shortest round-trip form.
pub fn number_to_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{:.0}", f)
    } else {
        format!("{}", f)
    }
}

/// Default `tostring` without metamethods.
pub fn tostring_basic(v: &Value) -> LuaStr {
    match v {
        Value::Nil => LuaStr::from("nil"),
        Value::Boolean(true) => LuaStr::from("true"),
        Value::Boolean(false) => LuaStr::from("false"),
        Value::Integer(i) => LuaStr::from(i.to_string()),
        Value::Number(f) => LuaStr::from(number_to_string(*f)),
        Value::Str(s) => s.clone(),
        other => LuaStr::from(format!("{other:?}")),
    }
}

/// String view used by concatenation: only strings and numbers convert.
pub fn to_concat_bytes(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Str(s) => Some(s.as_bytes().to_vec()),
        Value::Integer(i) => Some(i.to_string().into_bytes()),
        Value::Number(f) => Some(number_to_string(*f).into_bytes()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_number() {
        assert_eq!(str_to_number(b"42"), Some(42.0));
        assert_eq!(str_to_number(b"  -3.5  "), Some(-3.5));
        assert_eq!(str_to_number(b"0x10"), Some(16.0));
        assert_eq!(str_to_number(b"1e3"), Some(1000.0));
        assert_eq!(str_to_number(b"abc"), None);
        assert_eq!(str_to_number(b""), None);
        assert_eq!(str_to_number(b"1 2"), None);
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(-7.0), "-7");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::INFINITY), "inf");
    }

    #[test]
    fn test_to_integer() {
        assert_eq!(to_integer(&Value::Integer(5)), Some(5));
        assert_eq!(to_integer(&Value::Number(5.0)), Some(5));
        assert_eq!(to_integer(&Value::Number(5.5)), None);
        assert_eq!(to_integer(&Value::from("12")), Some(12));
    }
}
