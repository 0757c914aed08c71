//! Locale-independent number parsing and formatting
//!
//! The wire format mandates `.` as the decimal point. Rust's float parsing
//! and `Display` never consult the host locale, so everything here is a pure
//! function: no global state to save and restore.

use crate::error::{IndiError, IndiResult, ParseErrorKind};

/// Parse a number in plain decimal or sexagesimal notation
///
/// Sexagesimal accepts up to three components separated by whitespace, `:`
/// or `;`, e.g. `"12 34 56.7"` = 12 + 34/60 + 56.7/3600. The sign of the
/// first component applies to the whole value, so `"-0 30"` is -0.5.
pub fn parse_number(text: &str) -> IndiResult<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(IndiError::parse(ParseErrorKind::InvalidNumber, text));
    }

    if let Ok(value) = trimmed.parse::<f64>() {
        return Ok(value);
    }

    parse_sexagesimal(trimmed).ok_or_else(|| IndiError::parse(ParseErrorKind::InvalidNumber, text))
}

fn parse_sexagesimal(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ':' || c == ';')
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let negative = parts[0].starts_with('-');
    let mut total = 0.0;
    let mut scale = 1.0;
    for (i, part) in parts.iter().enumerate() {
        let component: f64 = part.parse().ok()?;
        if !component.is_finite() || (i > 0 && component < 0.0) {
            return None;
        }
        total += component.abs() / scale;
        scale *= 60.0;
    }

    Some(if negative { -total } else { total })
}

/// Value as written on the wire: shortest representation that parses back exactly
pub fn format_wire(value: f64) -> String {
    format!("{}", value)
}

/// Parsed `%[flags][width][.precision]conv` directive
#[derive(Debug, Default)]
struct Directive {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
    conv: char,
}

/// Format a value with a printf-style INDI number format
///
/// Supports `f`, `e`, `g`, `d`/`i` and the INDI sexagesimal `%<w>.<f>m`.
/// Text around the directive is kept; a format with no usable directive
/// falls back to the wire representation.
pub fn format_number(value: f64, format: &str) -> String {
    let Some(start) = format.find('%') else {
        return format_wire(value);
    };

    let (directive, consumed) = match parse_directive(&format[start + 1..]) {
        Some(found) => found,
        None => return format_wire(value),
    };

    let prefix = &format[..start];
    let suffix = &format[start + 1 + consumed..];

    let body = match directive.conv {
        'm' => {
            let frac = directive.precision.unwrap_or(3);
            let width = directive.width.saturating_sub(frac);
            return format!("{}{}{}", prefix, format_sexagesimal(value, width, frac), suffix);
        }
        'f' | 'F' => format_fixed(value, directive.precision.unwrap_or(6)),
        'e' | 'E' => format_exponent(value, directive.precision.unwrap_or(6), directive.conv == 'E'),
        'g' | 'G' => format_general(value, &directive),
        'd' | 'i' => format!("{}", value.round() as i64),
        _ => return format_wire(value),
    };

    format!("{}{}{}", prefix, pad(body, &directive), suffix)
}

fn parse_directive(spec: &str) -> Option<(Directive, usize)> {
    let bytes = spec.as_bytes();
    let mut d = Directive::default();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'-' => d.left = true,
            b'0' => d.zero = true,
            b'+' => d.plus = true,
            b' ' => d.space = true,
            b'#' => d.alt = true,
            _ => break,
        }
        i += 1;
    }

    let width_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    d.width = spec[width_start..i].parse().unwrap_or(0);

    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let prec_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        d.precision = Some(spec[prec_start..i].parse().unwrap_or(0));
    }

    // length modifiers carry no meaning for f64
    while i < bytes.len() && (bytes[i] == b'l' || bytes[i] == b'L' || bytes[i] == b'h') {
        i += 1;
    }

    let conv = *bytes.get(i)? as char;
    d.conv = conv;
    Some((d, i + 1))
}

fn pad(body: String, d: &Directive) -> String {
    let mut body = body;
    if !body.starts_with('-') {
        if d.plus {
            body.insert(0, '+');
        } else if d.space {
            body.insert(0, ' ');
        }
    }

    let len = body.chars().count();
    if len >= d.width {
        return body;
    }
    let fill = d.width - len;

    if d.left {
        format!("{}{}", body, " ".repeat(fill))
    } else if d.zero {
        let sign_len = if body.starts_with(['-', '+', ' ']) { 1 } else { 0 };
        let (sign, digits) = body.split_at(sign_len);
        format!("{}{}{}", sign, "0".repeat(fill), digits)
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn format_fixed(value: f64, precision: usize) -> String {
    format!("{:.*}", precision, value)
}

fn format_exponent(value: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{:.*e}", precision, value);
    let Some((mantissa, exponent)) = raw.split_once('e') else {
        return raw;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let e = if upper { 'E' } else { 'e' };
    format!("{}{}{}{:02}", mantissa, e, sign, exponent.abs())
}

fn format_general(value: f64, d: &Directive) -> String {
    let precision = match d.precision {
        Some(0) => 1,
        Some(p) => p,
        None => 6,
    };

    if !value.is_finite() {
        return format_wire(value);
    }

    let exponent = if value == 0.0 {
        0
    } else {
        let raw = format!("{:.*e}", precision - 1, value);
        raw.split_once('e')
            .and_then(|(_, e)| e.parse::<i32>().ok())
            .unwrap_or(0)
    };

    let body = if exponent < -4 || exponent >= precision as i32 {
        format_exponent(value, precision - 1, d.conv == 'G')
    } else {
        format_fixed(value, (precision as i32 - 1 - exponent).max(0) as usize)
    };

    if d.alt {
        body
    } else {
        strip_trailing_zeros(&body)
    }
}

fn strip_trailing_zeros(body: &str) -> String {
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => body.split_at(pos),
        None => (body, ""),
    };
    if !mantissa.contains('.') {
        return body.to_string();
    }
    let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", trimmed, exponent)
}

/// Render `value` as `[-]d:mm[:ss[.s]]`, degrees right-aligned in `width`
///
/// `frac` selects the resolution: 9 → `:mm:ss.ss`, 8 → `:mm:ss.s`,
/// 6 → `:mm:ss`, 5 → `:mm.m`, anything else → `:mm`.
pub fn format_sexagesimal(value: f64, width: usize, frac: usize) -> String {
    let fracbase: u64 = match frac {
        9 => 360_000,
        8 => 36_000,
        6 => 3_600,
        5 => 600,
        _ => 60,
    };

    let negative = value < 0.0;
    let n = (value.abs() * fracbase as f64 + 0.5) as u64;
    let degrees = n / fracbase;
    let f = n % fracbase;

    let mut out = if negative && degrees == 0 {
        format!("{:>width$}", "-0", width = width)
    } else if negative {
        format!("{:>width$}", -(degrees as i64), width = width)
    } else {
        format!("{:>width$}", degrees, width = width)
    };

    match fracbase {
        60 => out.push_str(&format!(":{:02}", f)),
        600 => out.push_str(&format!(":{:02}.{}", f / 10, f % 10)),
        3_600 => out.push_str(&format!(":{:02}:{:02}", f / 60, f % 60)),
        36_000 => {
            let s = f % 600;
            out.push_str(&format!(":{:02}:{:02}.{}", f / 600, s / 10, s % 10));
        }
        _ => {
            let s = f % 6_000;
            out.push_str(&format!(":{:02}:{:02}.{:02}", f / 6_000, s / 100, s % 100));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_decimal() {
        assert_eq!(parse_number("42").unwrap(), 42.0);
        assert_eq!(parse_number("  -3.25\n").unwrap(), -3.25);
        assert_eq!(parse_number("1e3").unwrap(), 1000.0);
    }

    #[test]
    fn test_sexagesimal_parsing() {
        assert_eq!(parse_number("10 30 00").unwrap(), 10.5);
        assert_eq!(parse_number("10:30").unwrap(), 10.5);
        assert_eq!(parse_number("-0 30").unwrap(), -0.5);
        assert_eq!(parse_number("-10;30;0").unwrap(), -10.5);

        let v = parse_number("12 34 56.7").unwrap();
        assert!((v - (12.0 + 34.0 / 60.0 + 56.7 / 3600.0)).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_numbers() {
        for bad in ["", "   ", "abc", "1 2 3 4", "10:-30", "12,5"] {
            let err = parse_number(bad).unwrap_err();
            assert!(
                matches!(err, IndiError::Parse { kind: ParseErrorKind::InvalidNumber, .. }),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_sexagesimal_round_trip() {
        let text = format_number(10.5, "%010.6m");
        assert_eq!(text, "  10:30:00");
        assert_eq!(parse_number(&text).unwrap(), 10.5);

        assert_eq!(format_number(-0.5, "%9.6m"), " -0:30:00");
        assert_eq!(format_number(-10.5, "%9.6m"), "-10:30:00");
        assert_eq!(format_number(10.5, "%5.3m"), "10:30");
        assert_eq!(format_number(10.25, "%7.5m"), "10:15.0");
        assert_eq!(format_number(1.0 + 1.0 / 3600.0 * 1.5, "%9.8m"), "1:00:01.5");
        assert_eq!(format_number(1.0 + 1.0 / 3600.0 * 1.25, "%10.9m"), "1:00:01.25");
    }

    #[test]
    fn test_printf_subset() {
        assert_eq!(format_number(3.14159, "%.2f"), "3.14");
        assert_eq!(format_number(3.14159, "%8.3f"), "   3.142");
        assert_eq!(format_number(-3.5, "%-8.1f|"), "-3.5    |");
        assert_eq!(format_number(3.5, "%08.2f"), "00003.50");
        assert_eq!(format_number(-3.5, "%08.2f"), "-0003.50");
        assert_eq!(format_number(2.5, "%+.1f"), "+2.5");
        assert_eq!(format_number(1500.0, "%.3e"), "1.500e+03");
        assert_eq!(format_number(0.00012, "%e"), "1.200000e-04");
        assert_eq!(format_number(7.6, "%d"), "8");
        assert_eq!(format_number(12.0, "%4.0f C"), "  12 C");
    }

    #[test]
    fn test_general_format() {
        assert_eq!(format_number(0.0001, "%g"), "0.0001");
        assert_eq!(format_number(0.00001, "%g"), "1e-05");
        assert_eq!(format_number(123456.0, "%g"), "123456");
        assert_eq!(format_number(1234567.0, "%g"), "1.23457e+06");
        assert_eq!(format_number(2.5, "%g"), "2.5");
        assert_eq!(format_number(100.0, "%.2g"), "1e+02");
        assert_eq!(format_number(0.0, "%g"), "0");
    }

    #[test]
    fn test_fallback_to_wire_format() {
        assert_eq!(format_number(1.25, ""), "1.25");
        assert_eq!(format_number(1.25, "%"), "1.25");
        assert_eq!(format_wire(0.1), "0.1");
        assert_eq!(parse_number(&format_wire(1.0 / 3.0)).unwrap(), 1.0 / 3.0);
    }
}
