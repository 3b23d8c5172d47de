//! Console output and the HolyC format interpreter.
//!
//! `hc_print_fmt` receives its arguments as an `i64` array: integers and
//! pointers arrive verbatim, floats arrive bit-cast. Output goes through
//! `libc::write` so ordering matches anything the linked C world prints
//! and no buffer survives a hard `exit`.

use std::ffi::CStr;
use std::os::raw::c_char;

fn write_stdout(bytes: &[u8]) {
    let mut off = 0;
    while off < bytes.len() {
        let n = unsafe {
            libc::write(1, bytes[off..].as_ptr() as *const libc::c_void, (bytes.len() - off) as libc::size_t)
        };
        if n <= 0 {
            break;
        }
        off += n as usize;
    }
}

/// Print a NUL-terminated string.
///
/// # Safety
/// `s` must be a valid NUL-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn hc_print_str(s: *const c_char) {
    if s.is_null() {
        return;
    }
    write_stdout(CStr::from_ptr(s).to_bytes());
}

/// Print a HolyC character literal: bytes emit lowest first and stop at
/// the first zero, so 'AB' prints "AB".
#[no_mangle]
pub extern "C" fn hc_put_char(ch: i64) {
    write_stdout(&char_bytes(ch));
}

pub(crate) fn char_bytes(ch: i64) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..8 {
        let b = ((ch >> (8 * i)) & 0xFF) as u8;
        if b == 0 {
            break;
        }
        out.push(b);
    }
    out
}

/// HolyC `"fmt", args...` entry point.
///
/// # Safety
/// `fmt` must be NUL-terminated; `args` must point to `argc` i64 slots.
#[no_mangle]
pub unsafe extern "C" fn hc_print_fmt(fmt: *const c_char, args: *const i64, argc: i64) {
    if fmt.is_null() {
        return;
    }
    let fmt = CStr::from_ptr(fmt).to_string_lossy();
    let args = if args.is_null() || argc <= 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(args, argc as usize)
    };
    let out = format_holyc(&fmt, args);
    write_stdout(out.as_bytes());
}

#[derive(Default, Clone, Copy)]
struct Spec {
    minus: bool,
    plus: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

fn pad(spec: &Spec, body: String) -> String {
    let width = match spec.width {
        Some(w) if w > body.len() => w,
        _ => return body,
    };
    let fill = width - body.len();
    if spec.minus {
        let mut out = body;
        out.push_str(&" ".repeat(fill));
        out
    } else if spec.zero && !body.starts_with(' ') {
        // Zero padding goes after any sign.
        let (sign, digits) = match body.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", body.as_str()),
        };
        format!("{}{}{}", sign, "0".repeat(fill), digits)
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn signed_body(spec: &Spec, v: i64) -> String {
    if spec.plus && v >= 0 {
        format!("+{}", v)
    } else {
        v.to_string()
    }
}

/// Interpret a HolyC format string over the packed argument array.
/// Unknown specifiers print verbatim; missing arguments read as 0.
pub fn format_holyc(fmt: &str, args: &[i64]) -> String {
    let chars: Vec<char> = fmt.chars().collect();
    let mut out = String::new();
    let mut ai = 0usize;
    let mut next_arg = |ai: &mut usize| -> i64 {
        let v = args.get(*ai).copied().unwrap_or(0);
        *ai += 1;
        v
    };

    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= chars.len() {
            out.push('%');
            break;
        }
        if chars[i] == '%' {
            out.push('%');
            i += 1;
            continue;
        }

        let mut spec = Spec::default();
        while i < chars.len() {
            match chars[i] {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                '0' => spec.zero = true,
                ' ' | '#' | '\'' | ',' => {}
                _ => break,
            }
            i += 1;
        }
        if i < chars.len() && chars[i] == '*' {
            spec.width = Some(next_arg(&mut ai).max(0) as usize);
            i += 1;
        } else {
            let mut w = String::new();
            while i < chars.len() && chars[i].is_ascii_digit() {
                w.push(chars[i]);
                i += 1;
            }
            if !w.is_empty() {
                spec.width = w.parse().ok();
            }
        }
        if i < chars.len() && chars[i] == '.' {
            i += 1;
            if i < chars.len() && chars[i] == '*' {
                spec.precision = Some(next_arg(&mut ai).max(0) as usize);
                i += 1;
            } else {
                let mut p = String::new();
                while i < chars.len() && chars[i].is_ascii_digit() {
                    p.push(chars[i]);
                    i += 1;
                }
                spec.precision = Some(p.parse().unwrap_or(0));
            }
        }
        while i < chars.len() && matches!(chars[i], 'h' | 'l' | 'j' | 't' | 'L' | 'q') {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let conv = chars[i];
        i += 1;
        match conv {
            'd' | 'i' => {
                let v = next_arg(&mut ai);
                out.push_str(&pad(&spec, signed_body(&spec, v)));
            }
            'u' => {
                let v = next_arg(&mut ai) as u64;
                out.push_str(&pad(&spec, v.to_string()));
            }
            'x' => {
                let v = next_arg(&mut ai) as u64;
                out.push_str(&pad(&spec, format!("{:x}", v)));
            }
            'X' => {
                let v = next_arg(&mut ai) as u64;
                out.push_str(&pad(&spec, format!("{:X}", v)));
            }
            'o' => {
                let v = next_arg(&mut ai) as u64;
                out.push_str(&pad(&spec, format!("{:o}", v)));
            }
            'b' => {
                let v = next_arg(&mut ai) as u64;
                out.push_str(&pad(&spec, format!("{:b}", v)));
            }
            'c' => {
                let v = next_arg(&mut ai);
                let body = String::from_utf8_lossy(&char_bytes(v)).into_owned();
                out.push_str(&pad(&spec, body));
            }
            's' => {
                let p = next_arg(&mut ai);
                let mut body = if p == 0 {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(p as *const c_char).to_string_lossy().into_owned() }
                };
                if let Some(prec) = spec.precision {
                    body.truncate(prec);
                }
                out.push_str(&pad(&spec, body));
            }
            'p' | 'P' => {
                let v = next_arg(&mut ai) as u64;
                let body = if conv == 'p' {
                    format!("0x{:x}", v)
                } else {
                    format!("0x{:X}", v)
                };
                out.push_str(&pad(&spec, body));
            }
            'z' => {
                // Index into a NUL-separated, double-NUL-terminated list.
                let idx = next_arg(&mut ai);
                let table = next_arg(&mut ai);
                if table != 0 {
                    let body = unsafe { list_entry(table as *const c_char, idx) };
                    out.push_str(&pad(&spec, body));
                }
            }
            'f' | 'F' => {
                let v = f64::from_bits(next_arg(&mut ai) as u64);
                let prec = spec.precision.unwrap_or(6);
                out.push_str(&pad(&spec, format!("{:.*}", prec, v)));
            }
            'e' | 'E' => {
                let v = f64::from_bits(next_arg(&mut ai) as u64);
                let prec = spec.precision.unwrap_or(6);
                let body = format!("{:.*e}", prec, v);
                out.push_str(&pad(&spec, if conv == 'E' { body.to_uppercase() } else { body }));
            }
            'g' | 'G' => {
                let v = f64::from_bits(next_arg(&mut ai) as u64);
                let body = format!("{}", v);
                out.push_str(&pad(&spec, if conv == 'G' { body.to_uppercase() } else { body }));
            }
            other => {
                out.push('%');
                out.push(other);
            }
        }
    }
    out
}

/// Walk a `a\0b\0c\0\0` style list to the idx'th entry.
unsafe fn list_entry(table: *const c_char, idx: i64) -> String {
    let mut p = table;
    let mut k = 0i64;
    loop {
        let entry = CStr::from_ptr(p);
        let bytes = entry.to_bytes();
        if k == idx {
            return entry.to_string_lossy().into_owned();
        }
        if bytes.is_empty() {
            return String::new();
        }
        p = p.add(bytes.len() + 1);
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_plain_text() {
        assert_eq!(format_holyc("hello\n", &[]), "hello\n");
    }

    #[test]
    fn test_decimal_and_string() {
        let s = CString::new("hi").unwrap();
        assert_eq!(format_holyc("%d %s\n", &[42, s.as_ptr() as i64]), "42 hi\n");
    }

    #[test]
    fn test_widths_and_flags() {
        assert_eq!(format_holyc("%5d", &[42]), "   42");
        assert_eq!(format_holyc("%-5d|", &[42]), "42   |");
        assert_eq!(format_holyc("%05d", &[42]), "00042");
        assert_eq!(format_holyc("%+d", &[42]), "+42");
        assert_eq!(format_holyc("%05d", &[-42]), "-0042");
    }

    #[test]
    fn test_star_width() {
        assert_eq!(format_holyc("%*d", &[5, 42]), "   42");
    }

    #[test]
    fn test_hex_octal_binary() {
        assert_eq!(format_holyc("%x %X %o %b", &[255, 255, 8, 5]), "ff FF 10 101");
    }

    #[test]
    fn test_char_multibyte() {
        assert_eq!(format_holyc("%c", &[0x4241]), "AB");
    }

    #[test]
    fn test_float_bitcast() {
        let bits = 1.5f64.to_bits() as i64;
        assert_eq!(format_holyc("%f", &[bits]), "1.500000");
        assert_eq!(format_holyc("%.2f", &[bits]), "1.50");
    }

    #[test]
    fn test_percent_literal() {
        assert_eq!(format_holyc("100%%", &[]), "100%");
    }

    #[test]
    fn test_z_list() {
        let table: &[u8] = b"zero\0one\0two\0\0";
        let p = table.as_ptr() as i64;
        assert_eq!(format_holyc("%z", &[1, p]), "one");
        assert_eq!(format_holyc("%z", &[0, p]), "zero");
    }

    #[test]
    fn test_length_modifiers_skipped() {
        assert_eq!(format_holyc("%lld %hd", &[7, 9]), "7 9");
    }

    #[test]
    fn test_missing_args_read_zero() {
        assert_eq!(format_holyc("%d", &[]), "0");
    }

    #[test]
    fn test_string_precision() {
        let s = CString::new("abcdef").unwrap();
        assert_eq!(format_holyc("%.3s", &[s.as_ptr() as i64]), "abc");
    }

    #[test]
    fn test_pointer() {
        assert_eq!(format_holyc("%p", &[0xABC]), "0xabc");
        assert_eq!(format_holyc("%P", &[0xABC]), "0xABC");
    }

    #[test]
    fn test_char_bytes_stop_at_zero() {
        assert_eq!(char_bytes(0x41), vec![0x41]);
        assert_eq!(char_bytes(0x4241), vec![0x41, 0x42]);
        assert_eq!(char_bytes(0), Vec::<u8>::new());
    }
}
