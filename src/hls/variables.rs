//! `EXT-X-DEFINE` variable table and `{$name}` substitution.

use super::attributes::{Attribute, find};
use std::borrow::Cow;
use std::collections::HashMap;
use url::Url;

/// Variables defined so far in one playlist. Lives for one rewrite only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableTable {
    values: HashMap<String, String>,
}

/// Result of substituting variable references in one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution<'a> {
    pub text: Cow<'a, str>,
    /// Names referenced but not defined; their tokens remain verbatim.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefineError {
    #[error("EXT-X-DEFINE without NAME, QUERYPARAM or IMPORT")]
    MissingName,

    #[error("EXT-X-DEFINE NAME=\"{0}\" has no VALUE")]
    MissingValue(String),

    #[error("EXT-X-DEFINE QUERYPARAM=\"{0}\" is not present in the playlist URL")]
    QueryParamAbsent(String),

    #[error("EXT-X-DEFINE IMPORT=\"{0}\" needs the parent playlist and cannot be resolved here")]
    ImportUnsupported(String),

    #[error("invalid variable name \"{0}\"")]
    InvalidName(String),
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or overwrite a variable.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Apply one `EXT-X-DEFINE` tag.
    ///
    /// `NAME`/`VALUE` pairs and `QUERYPARAM` (looked up in the playlist's own
    /// URL) are supported. Returns the defined name.
    pub fn define_from_tag(
        &mut self,
        attributes: &[Attribute<'_>],
        playlist_url: &Url,
    ) -> Result<String, DefineError> {
        if let Some(name) = find(attributes, "NAME") {
            let name = valid_name(name.value)?;
            let value = find(attributes, "VALUE").ok_or_else(|| DefineError::MissingValue(name.to_string()))?;
            self.define(name, value.value);
            return Ok(name.to_string());
        }

        if let Some(param) = find(attributes, "QUERYPARAM") {
            let name = valid_name(param.value)?;
            let value = playlist_url
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .ok_or_else(|| DefineError::QueryParamAbsent(name.to_string()))?;
            self.define(name, value);
            return Ok(name.to_string());
        }

        if let Some(import) = find(attributes, "IMPORT") {
            return Err(DefineError::ImportUnsupported(import.value.to_string()));
        }

        Err(DefineError::MissingName)
    }

    /// Replace every `{$name}` whose name is defined.
    ///
    /// Undefined references are left as literal tokens and reported.
    pub fn substitute<'a>(&self, input: &'a str) -> Substitution<'a> {
        if !input.contains("{$") {
            return Substitution {
                text: Cow::Borrowed(input),
                unresolved: Vec::new(),
            };
        }

        let mut out = String::with_capacity(input.len());
        let mut unresolved = Vec::new();
        let mut rest = input;

        while let Some(start) = rest.find("{$") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            match after.find('}') {
                Some(end) if is_valid_name(&after[..end]) => {
                    let name = &after[..end];
                    match self.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str(&rest[start..start + 2 + end + 1]);
                            if !unresolved.iter().any(|n| n == name) {
                                unresolved.push(name.to_string());
                            }
                        }
                    }
                    rest = &after[end + 1..];
                }
                _ => {
                    // Not a reference; keep the two marker characters and move on.
                    out.push_str("{$");
                    rest = after;
                }
            }
        }
        out.push_str(rest);

        Substitution {
            text: Cow::Owned(out),
            unresolved,
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn valid_name(name: &str) -> Result<&str, DefineError> {
    if is_valid_name(name) {
        Ok(name)
    } else {
        Err(DefineError::InvalidName(name.to_string()))
    }
}
