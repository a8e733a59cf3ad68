use crate::error::{CorralError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};

/// Moment-style tokens and their strftime equivalents, longest first
const TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("MMMM", "%B"),
    ("dddd", "%A"),
    ("SSS", "%3f"),
    ("MMM", "%b"),
    ("ddd", "%a"),
    ("YY", "%y"),
    ("MM", "%m"),
    ("DD", "%d"),
    ("HH", "%H"),
    ("hh", "%I"),
    ("mm", "%M"),
    ("ss", "%S"),
    ("ZZ", "%z"),
    ("M", "%-m"),
    ("D", "%-d"),
    ("H", "%-H"),
    ("h", "%-I"),
    ("m", "%-M"),
    ("s", "%-S"),
    ("Z", "%:z"),
    ("A", "%p"),
    ("a", "%P"),
    ("X", "%s"),
];

/// Log line timestamp format, stored as a validated strftime string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampFormat {
    strftime: String,
}

impl TimestampFormat {
    /// Translate a moment-style format (`YYYY-MM-DD HH:mm:ss Z`).
    ///
    /// Text inside `[...]` is copied literally, unknown characters pass through.
    pub fn parse(moment: &str) -> Result<Self> {
        let mut strftime = String::with_capacity(moment.len() * 2);
        let mut rest = moment;

        'outer: while let Some(ch) = rest.chars().next() {
            if ch == '[' {
                let Some(end) = rest.find(']') else {
                    return Err(CorralError::Validation(format!(
                        "unterminated '[' in log date format '{}'",
                        moment
                    )));
                };
                push_literal(&mut strftime, &rest[1..end]);
                rest = &rest[end + 1..];
                continue;
            }

            for (token, spec) in TOKENS {
                if let Some(after) = rest.strip_prefix(token) {
                    strftime.push_str(spec);
                    rest = after;
                    continue 'outer;
                }
            }

            push_literal(&mut strftime, &rest[..ch.len_utf8()]);
            rest = &rest[ch.len_utf8()..];
        }

        if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
            return Err(CorralError::Validation(format!(
                "unsupported log date format '{}'",
                moment
            )));
        }

        Ok(Self { strftime })
    }

    pub fn as_strftime(&self) -> &str {
        &self.strftime
    }

    pub fn format<Tz>(&self, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        at.format(&self.strftime).to_string()
    }
}

fn push_literal(out: &mut String, text: &str) {
    for c in text.chars() {
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
    }
}
