//! Canonical block serialization and digest.
//!
//! Digests must match across every node validating the same block, including
//! nodes not written in Rust. The canonical form is JSON with keys in name
//! order, `", "` and `": "` separators, every character outside printable
//! ASCII escaped as `\uXXXX`, and floats in shortest round-trip form laid out
//! positionally for decimal exponents in `-4..16`, as `1e+16` style otherwise.

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use sha2::{Digest, Sha256};
use std::io;

use crate::types::{Block, CryptoError};

/// JSON formatter producing the canonical layout.
///
/// Key order comes from the field declaration order of the serialized
/// records, which are kept sorted by name.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
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

    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(float_repr(value).as_bytes())
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        let mut run_start = 0;
        for (at, ch) in fragment.char_indices() {
            if (' '..='~').contains(&ch) {
                continue;
            }
            writer.write_all(fragment[run_start..at].as_bytes())?;
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            run_start = at + ch.len_utf8();
        }
        writer.write_all(fragment[run_start..].as_bytes())
    }
}

/// Shortest round-trip decimal for a finite `value` in canonical layout.
fn float_repr(value: f64) -> String {
    let sign = if value.is_sign_negative() { "-" } else { "" };
    let sci = format!("{:e}", value.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    if !(-4..16).contains(&exp) {
        let exp_sign = if exp < 0 { '-' } else { '+' };
        return format!("{sign}{mantissa}e{exp_sign}{:02}", exp.unsigned_abs());
    }

    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    if exp < 0 {
        let zeros = "0".repeat(exp.unsigned_abs() as usize - 1);
        return format!("{sign}0.{zeros}{digits}");
    }
    let point = exp as usize + 1;
    if digits.len() > point {
        format!("{sign}{}.{}", &digits[..point], &digits[point..])
    } else {
        format!("{sign}{digits}{}.0", "0".repeat(point - digits.len()))
    }
}

/// Serialize any record into its canonical byte form.
pub fn canonical_bytes<T>(value: &T) -> Result<Vec<u8>, CryptoError>
where
    T: Serialize + ?Sized,
{
    let mut out = Vec::with_capacity(256);
    let mut ser = Serializer::with_formatter(&mut out, CanonicalFormatter);
    value
        .serialize(&mut ser)
        .map_err(|e| CryptoError::HashConversion(e.to_string()))?;
    Ok(out)
}

/// SHA-256 of the block's canonical form, as lowercase hex.
pub fn hash(block: &Block) -> Result<String, CryptoError> {
    let bytes = canonical_bytes(block)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
