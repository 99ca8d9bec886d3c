//! Restricted `os` library: time, date, difftime, clock and nothing else.
//!
//! execute/remove/rename/tmpname/getenv/exit are absent by policy — the
//! sandbox exposes read-only wall-clock access only.

use crate::{check_number, check_table, register_fn};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use warden_core::error::{LuaError, LuaResult};
use warden_core::native::NativeCallScope;
use warden_core::string::LuaStr;
use warden_core::table::{Table, TableRef};
use warden_core::value::{value_of_i64, Value};
use warden_vm::{coerce, Globals};

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

pub fn register(globals: &Arc<Globals>) {
    PROCESS_START.get_or_init(Instant::now);
    let t = TableRef::new(Table::new(0, 4));
    register_fn(&t, "time", native_time);
    register_fn(&t, "date", native_date);
    register_fn(&t, "difftime", native_difftime);
    register_fn(&t, "clock", native_clock);
    globals.env().set_str("os", Value::Table(t));
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Civil calendar from days since the epoch (Howard Hinnant's algorithm).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as u64;
    let doy = (153 * mp + 2) / 5 + d as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

struct Broken {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    min: u32,
    sec: u32,
    wday: u32,
    yday: u32,
}

fn break_down(epoch: f64) -> Broken {
    let total = epoch as i64;
    let days = total.div_euclid(86_400);
    let secs = total.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    // 1970-01-01 was a Thursday; Lua weekdays are 1-based from Sunday.
    let wday = ((days + 4).rem_euclid(7) + 1) as u32;
    let yday = (days - days_from_civil(year, 1, 1) + 1) as u32;
    Broken {
        year,
        month,
        day,
        hour: (secs / 3600) as u32,
        min: ((secs / 60) % 60) as u32,
        sec: (secs % 60) as u32,
        wday,
        yday,
    }
}

fn native_time(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    match args.first() {
        None | Some(Value::Nil) => Ok(vec![value_of_i64(now_epoch() as i64)]),
        Some(Value::Table(_)) => {
            let t = check_table(args, 0, "time")?;
            let field = |name: &str, default: Option<i64>| -> LuaResult<i64> {
                let v = t.get_str(name);
                match coerce::to_integer(&v) {
                    Some(i) => Ok(i),
                    None => default.ok_or_else(|| {
                        LuaError::msg(format!("field '{name}' missing in date table"))
                    }),
                }
            };
            let year = field("year", None)?;
            let month = field("month", None)?;
            let day = field("day", None)?;
            let hour = field("hour", Some(12))?;
            let min = field("min", Some(0))?;
            let sec = field("sec", Some(0))?;
            let days = days_from_civil(year, month.clamp(1, 12) as u32, day.clamp(1, 31) as u32);
            Ok(vec![value_of_i64(
                days * 86_400 + hour * 3600 + min * 60 + sec,
            )])
        }
        Some(other) => Err(crate::arg_error(0, "time", "table", other)),
    }
}

fn native_difftime(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let t2 = check_number(args, 0, "difftime")?;
    let t1 = check_number(args, 1, "difftime")?;
    Ok(vec![Value::Number(t2 - t1)])
}

fn native_clock(_s: &mut dyn NativeCallScope, _args: &[Value]) -> LuaResult<Vec<Value>> {
    let start = PROCESS_START.get_or_init(Instant::now);
    Ok(vec![Value::Number(start.elapsed().as_secs_f64())])
}

const WEEKDAY_ABBREV: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const WEEKDAY: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];
const MONTH_ABBREV: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const MONTH: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

fn native_date(_s: &mut dyn NativeCallScope, args: &[Value]) -> LuaResult<Vec<Value>> {
    let mut format = match args.first() {
        None | Some(Value::Nil) => "%c".to_string(),
        Some(Value::Str(s)) => s.to_lossy(),
        Some(other) => return Err(crate::arg_error(0, "date", "string", other)),
    };
    let epoch = match args.get(1) {
        None | Some(Value::Nil) => now_epoch(),
        Some(v) => coerce::to_number(v).ok_or_else(|| crate::arg_error(1, "date", "number", v))?,
    };
    // All times are civil UTC; '!' is accepted and means the same here.
    if let Some(rest) = format.strip_prefix('!') {
        format = rest.to_string();
    }
    let b = break_down(epoch);

    if format == "*t" {
        let t = TableRef::new(Table::new(0, 9));
        t.set_str("year", value_of_i64(b.year));
        t.set_str("month", value_of_i64(b.month as i64));
        t.set_str("day", value_of_i64(b.day as i64));
        t.set_str("hour", value_of_i64(b.hour as i64));
        t.set_str("min", value_of_i64(b.min as i64));
        t.set_str("sec", value_of_i64(b.sec as i64));
        t.set_str("wday", value_of_i64(b.wday as i64));
        t.set_str("yday", value_of_i64(b.yday as i64));
        t.set_str("isdst", Value::Boolean(false));
        return Ok(vec![Value::Table(t)]);
    }

    let mut out = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => break,
            Some(spec) => match spec {
                '%' => out.push('%'),
                'a' => out.push_str(WEEKDAY_ABBREV[(b.wday - 1) as usize]),
                'A' => out.push_str(WEEKDAY[(b.wday - 1) as usize]),
                'b' => out.push_str(MONTH_ABBREV[(b.month - 1) as usize]),
                'B' => out.push_str(MONTH[(b.month - 1) as usize]),
                'c' => out.push_str(&format!(
                    "{} {} {:2} {:02}:{:02}:{:02} {}",
                    WEEKDAY_ABBREV[(b.wday - 1) as usize],
                    MONTH_ABBREV[(b.month - 1) as usize],
                    b.day,
                    b.hour,
                    b.min,
                    b.sec,
                    b.year
                )),
                'd' => out.push_str(&format!("{:02}", b.day)),
                'H' => out.push_str(&format!("{:02}", b.hour)),
                'I' => out.push_str(&format!("{:02}", if b.hour % 12 == 0 { 12 } else { b.hour % 12 })),
                'j' => out.push_str(&format!("{:03}", b.yday)),
                'm' => out.push_str(&format!("{:02}", b.month)),
                'M' => out.push_str(&format!("{:02}", b.min)),
                'p' => out.push_str(if b.hour < 12 { "AM" } else { "PM" }),
                'S' => out.push_str(&format!("{:02}", b.sec)),
                'w' => out.push_str(&format!("{}", b.wday - 1)),
                'x' => out.push_str(&format!("{:02}/{:02}/{:02}", b.month, b.day, b.year % 100)),
                'X' => out.push_str(&format!("{:02}:{:02}:{:02}", b.hour, b.min, b.sec)),
                'y' => out.push_str(&format!("{:02}", b.year % 100)),
                'Y' => out.push_str(&format!("{}", b.year)),
                other => {
                    return Err(LuaError::msg(format!(
                        "invalid conversion specifier '%{other}' to 'date'"
                    )))
                }
            },
        }
    }
    Ok(vec![Value::Str(LuaStr::from(out))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civil_roundtrip() {
        for days in [-1000i64, -1, 0, 1, 365, 10_000, 19_723] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
    }

    #[test]
    fn test_epoch_breakdown() {
        let b = break_down(0.0);
        assert_eq!((b.year, b.month, b.day), (1970, 1, 1));
        assert_eq!((b.hour, b.min, b.sec), (0, 0, 0));
        // 1970-01-01 was a Thursday (wday 5, 1-based from Sunday).
        assert_eq!(b.wday, 5);
        assert_eq!(b.yday, 1);
    }

    #[test]
    fn test_known_date() {
        // 2000-03-01 00:00:00 UTC
        let days = days_from_civil(2000, 3, 1);
        let b = break_down((days * 86_400) as f64);
        assert_eq!((b.year, b.month, b.day), (2000, 3, 1));
    }
}
