//! Attribute-list scanning for HLS tag lines.
//!
//! Works on raw line text and reports byte spans, so callers can replace a
//! single value while leaving every other character of the line untouched.

use std::ops::Range;

/// One `NAME=value` pair of a tag's attribute list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub name: &'a str,
    /// Value text, without surrounding quotes.
    pub value: &'a str,
    pub quoted: bool,
    /// Byte span of `value` within the line.
    pub value_span: Range<usize>,
    /// Byte span of the whole `NAME=value` pair within the line.
    pub span: Range<usize>,
}

/// Scan the attribute list that follows the first `:` of a tag line.
///
/// Quoted values may contain commas. Scanning stops at the first malformed
/// pair (missing `=`, unterminated quote); pairs found before it are kept.
pub fn parse_attributes(line: &str) -> Vec<Attribute<'_>> {
    let Some(colon) = line.find(':') else {
        return Vec::new();
    };

    let bytes = line.as_bytes();
    let mut attributes = Vec::new();
    let mut pos = colon + 1;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        let pair_start = pos;

        let Some(eq_offset) = line[pos..].find(['=', ',']) else {
            break;
        };
        let eq = pos + eq_offset;
        if bytes[eq] != b'=' {
            // Bare token without a value: not an attribute list we understand.
            break;
        }
        let name = line[pair_start..eq].trim();

        let value_start = eq + 1;
        let (value_span, pair_end, quoted) = if bytes.get(value_start) == Some(&b'"') {
            let Some(close) = line[value_start + 1..].find('"') else {
                break;
            };
            let close = value_start + 1 + close;
            (value_start + 1..close, close + 1, true)
        } else {
            let end = line[value_start..]
                .find(',')
                .map_or(bytes.len(), |i| value_start + i);
            (value_start..end, end, false)
        };

        attributes.push(Attribute {
            name,
            value: &line[value_span.clone()],
            quoted,
            value_span,
            span: pair_start..pair_end,
        });

        // Skip to the next separator; tolerates junk after a closing quote.
        pos = match line[pair_end..].find(',') {
            Some(i) => pair_end + i + 1,
            None => bytes.len(),
        };
    }

    attributes
}

/// Find an attribute by exact name.
pub fn find<'l, 'a>(attributes: &'l [Attribute<'a>], name: &str) -> Option<&'l Attribute<'a>> {
    attributes.iter().find(|a| a.name == name)
}

/// Replace several non-overlapping spans of `line` in one pass.
///
/// `replacements` must be sorted by span start.
pub fn replace_spans(line: &str, replacements: &[(Range<usize>, String)]) -> String {
    let extra: usize = replacements.iter().map(|(_, r)| r.len()).sum();
    let mut out = String::with_capacity(line.len() + extra);
    let mut cursor = 0;

    for (span, replacement) in replacements {
        out.push_str(&line[cursor..span.start]);
        out.push_str(replacement);
        cursor = span.end;
    }
    out.push_str(&line[cursor..]);
    out
}

/// Remove an attribute together with one adjacent comma.
pub fn remove_attribute(line: &str, attribute: &Attribute<'_>) -> String {
    let bytes = line.as_bytes();
    let span = &attribute.span;

    let cut = if span.start > 0 && bytes[span.start - 1] == b',' {
        span.start - 1..span.end
    } else if bytes.get(span.end) == Some(&b',') {
        span.start..span.end + 1
    } else {
        span.clone()
    };

    replace_spans(line, &[(cut, String::new())])
}
