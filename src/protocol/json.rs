//! # Legacy JSON Layout
//!
//! The dictation client was built against a JSON encoder that puts a space after
//! every `,` and `:` and escapes everything outside printable ASCII as `\uXXXX`.
//! Numbers that the client reads as strings (word confidences) use the same
//! encoder's float spelling: `0.8`, `1.0`, `1e-05`.

use serde::Serialize;
use serde_json::ser::Formatter;
use std::io;

/// `serde_json` formatter reproducing the legacy layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyFormatter;

impl Formatter for LegacyFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut plain_start = 0;
        for (index, ch) in fragment.char_indices() {
            if is_plain_ascii(ch) {
                continue;
            }
            writer.write_all(fragment[plain_start..index].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            plain_start = index + ch.len_utf8();
        }
        writer.write_all(fragment[plain_start..].as_bytes())
    }
}

/// Characters written as-is; everything else becomes a `\u` escape.
fn is_plain_ascii(ch: char) -> bool {
    (' '..='~').contains(&ch)
}

/// Serialize `value` in the legacy layout. The output is always ASCII.
pub fn to_legacy_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, LegacyFormatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// Spell a float the way the legacy encoder does.
///
/// ## Rules:
/// - Shortest digits that round-trip
/// - Positional notation for exponents in `-4..16`, always with a fractional part (`1.0`)
/// - Otherwise scientific with a signed, at least two-digit exponent (`1e-05`, `1.5e+16`)
pub fn legacy_float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "1.2345e2" or "8e-1"
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    let body = if (-4..16).contains(&exponent) {
        if exponent < 0 {
            format!("0.{}{}", "0".repeat((-exponent - 1) as usize), digits)
        } else {
            let point = exponent as usize + 1;
            if digits.len() <= point {
                format!("{}{}.0", digits, "0".repeat(point - digits.len()))
            } else {
                format!("{}.{}", &digits[..point], &digits[point..])
            }
        }
    } else {
        let mantissa = if digits.len() > 1 {
            format!("{}.{}", &digits[..1], &digits[1..])
        } else {
            digits
        };
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    };

    if value < 0.0 {
        format!("-{}", body)
    } else {
        body
    }
}
