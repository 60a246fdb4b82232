//! Graphite plaintext protocol: one `<path> <value> <timestamp>\n` line per
//! sample.

use crate::metric::Sample;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref SCHEME: Regex = Regex::new(r"https?|:|//").expect("scheme pattern");
    static ref SEPARATOR: Regex = Regex::new(r"[/.]").expect("separator pattern");
}

/// Reduce a free-form service identifier to a single graphite path segment.
///
/// Strips `http`, `https`, `:` and `//`, then replaces any remaining `/` and
/// `.` with `_`. Stripping repeats until nothing more matches, otherwise
/// inputs like `htthttpp` would collapse into a fresh `http` and the result
/// would change on a second pass. Total and idempotent.
pub fn sanitize(name: &str) -> String {
    let mut stripped = name.to_string();
    loop {
        let next = match SCHEME.replace_all(&stripped, "") {
            Cow::Borrowed(_) => break,
            Cow::Owned(s) => s,
        };
        stripped = next;
    }
    SEPARATOR.replace_all(&stripped, "_").into_owned()
}

/// Append the wire line for `sample` to `buf`.
///
/// Returns false, leaving `buf` untouched, when the sample has nothing to
/// put on the wire: no value, a value graphite cannot parse (`NaN`, `inf`),
/// or an empty path. A missing value is never sent as zero. Whitespace in the
/// path would split the line into bogus fields, so it is written as `_`.
pub fn encode_into(sample: &Sample, buf: &mut String) -> bool {
    let value = match sample.value() {
        Some(v) if v.is_finite() => v,
        _ => return false,
    };
    if sample.path().is_empty() {
        return false;
    }
    for c in sample.path().chars() {
        if c.is_whitespace() || c.is_control() {
            buf.push('_');
        } else {
            buf.push(c);
        }
    }
    buf.push(' ');
    buf.push_str(&value.to_string());
    buf.push(' ');
    buf.push_str(&sample.timestamp().to_string());
    buf.push('\n');
    true
}

/// The wire line for `sample`, or `None` if it is not sent. See
/// `encode_into`.
pub fn encode(sample: &Sample) -> Option<String> {
    let mut line = String::with_capacity(sample.path().len() + 32);
    if encode_into(sample, &mut line) {
        Some(line)
    } else {
        None
    }
}
