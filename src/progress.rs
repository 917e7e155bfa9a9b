//! Progress lines printed by a single-file converter.
//!
//! In [`crate::ConvertMode::SingleFile`] the converter does not speak
//! multipart. It prints one line per event on stdout:
//!
//! | Line | Meaning | `progress` fragment body |
//! |------|---------|--------------------------|
//! | `c3/10` | 3 of 10 children processed | `{"children":{"nProcessed":3,"nTotal":10}}` |
//! | `b512/2048` | 512 of 2048 bytes processed | `{"bytes":{"nProcessed":512,"nTotal":2048}}` |
//! | `0.25` | fraction complete, 0 to 1 | `0.25` |
//! | anything else | an error message | (becomes an `error` fragment) |
//!
//! # Example
//!
//! ```rust
//! use convert_worker::progress::{classify, ConverterLine};
//!
//! assert_eq!(
//!     classify("c1/3"),
//!     ConverterLine::Children { processed: 1, total: 3 }
//! );
//! assert_eq!(
//!     classify("c1/3").progress_body().as_deref(),
//!     Some(r#"{"children":{"nProcessed":1,"nTotal":3}}"#)
//! );
//! assert!(classify("Not a PDF").progress_body().is_none());
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

static CHILDREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^c(\d+)/(\d+)$").unwrap());
static BYTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"^b(\d+)/(\d+)$").unwrap());
static FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:0(?:\.\d*)?|1(?:\.0*)?|\.\d+)$").unwrap());

/// One classified line of converter output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterLine {
    Children { processed: u64, total: u64 },
    Bytes { processed: u64, total: u64 },
    /// A decimal fraction, kept verbatim.
    Fraction(String),
    /// Anything else: the converter is reporting an error.
    Message(String),
}

impl ConverterLine {
    /// The `progress` fragment body, or `None` for an error message.
    pub fn progress_body(&self) -> Option<String> {
        match self {
            ConverterLine::Children { processed, total } => Some(format!(
                r#"{{"children":{{"nProcessed":{processed},"nTotal":{total}}}}}"#
            )),
            ConverterLine::Bytes { processed, total } => Some(format!(
                r#"{{"bytes":{{"nProcessed":{processed},"nTotal":{total}}}}}"#
            )),
            ConverterLine::Fraction(f) => Some(f.clone()),
            ConverterLine::Message(_) => None,
        }
    }
}

/// Classify one line. Trailing `\r` / `\n` must already be stripped.
pub fn classify(line: &str) -> ConverterLine {
    if let Some((processed, total)) = counts(&CHILDREN, line) {
        return ConverterLine::Children { processed, total };
    }
    if let Some((processed, total)) = counts(&BYTES, line) {
        return ConverterLine::Bytes { processed, total };
    }
    if FRACTION.is_match(line) {
        return ConverterLine::Fraction(line.to_string());
    }
    ConverterLine::Message(line.to_string())
}

// Counts too large for u64 fall through to `Message`.
fn counts(re: &Regex, line: &str) -> Option<(u64, u64)> {
    let caps = re.captures(line)?;
    let processed = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;
    Some((processed, total))
}
