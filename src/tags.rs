//! `key=value` tag list parsing.
//!
//! Every flag group that accepts tags (`log.ctx`, `stats.tags`,
//! `profiling.tags`, `tracing.tags`, `tracing.headers`) funnels its raw
//! strings through [`parse`].

use thiserror::Error;

/// Separator between a tag's key and value.
pub const TAG_SEPARATOR: &str = "=";

/// Errors produced while splitting tag lists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    /// An entry did not contain the separator.
    #[error("string {entry:?} does not contain {separator:?}")]
    InvalidEntry { entry: String, separator: String },
}

/// Split each entry on the first occurrence of `sep`.
///
/// Either every entry splits and the pairs come back in input order, or the
/// first offending entry is reported and nothing else is returned.
pub fn split<S: AsRef<str>>(entries: &[S], sep: &str) -> Result<Vec<(String, String)>, TagError> {
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.as_ref();
        match entry.split_once(sep) {
            Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
            None => {
                return Err(TagError::InvalidEntry {
                    entry: entry.to_string(),
                    separator: sep.to_string(),
                })
            }
        }
    }
    Ok(pairs)
}

/// Split `key=value` entries.
pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Vec<(String, String)>, TagError> {
    split(entries, TAG_SEPARATOR)
}
