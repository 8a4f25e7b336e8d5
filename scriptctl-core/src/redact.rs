//! Masking of secret-looking environment values in process output.
//!
//! Detection looks at variable *names*; masking looks for the captured
//! *values*, both verbatim and in their URL percent-encoded form.

use once_cell::sync::Lazy;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::{NoExpand, Regex, RegexBuilder};
use std::borrow::Cow;
use tracing::warn;

pub const MASK: &str = "****";

/// Values shorter than this are never captured.
pub const MIN_SECRET_LEN: usize = 4;

// Compiled size ceiling for one value pattern
const VALUE_PATTERN_SIZE_LIMIT: usize = 1 << 20;

static SECRET_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    compile_regex(
        r"(?i)(secret|token|password|passwd|pass|api[_-]?key|access[_-]?key|private|auth|bearer|client[_-]?secret)",
    )
});

// Characters left alone by URI component encoding
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Only reached with a broken literal pattern, covered by tests
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

fn compile_value_pattern(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .size_limit(VALUE_PATTERN_SIZE_LIMIT)
        .build()
    {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("Secret value of {} bytes cannot be masked: {}", pattern.len(), err);
            None
        }
    }
}

/// Returns the values of variables whose names look secret.
pub fn detect<'a, I, K, V>(env: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a K, &'a V)>,
    K: AsRef<str> + ?Sized + 'a,
    V: AsRef<str> + ?Sized + 'a,
{
    let mut values: Vec<String> = env
        .into_iter()
        .filter(|(key, value)| {
            value.as_ref().chars().count() >= MIN_SECRET_LEN
                && SECRET_KEY_REGEX.is_match(key.as_ref())
        })
        .map(|(_, value)| value.as_ref().to_string())
        .collect();
    values.sort();
    values.dedup();
    values
}

/// One-shot masking of `text` with `values`.
pub fn mask(text: &str, values: &[String]) -> String {
    SecretRedactor::new(values.iter().cloned()).mask(text).into_owned()
}

/// Compiled matchers for the secrets of one process run.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    values: Vec<String>,
    patterns: Vec<Regex>,
    max_len: usize,
}

impl SecretRedactor {
    pub fn new<I>(values: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        // Longer secrets first so a secret containing another is masked whole
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();

        let mut kept = Vec::with_capacity(values.len());
        let mut patterns = Vec::with_capacity(values.len() * 2);
        let mut max_len = 0;
        for raw in values {
            let Some(plain) = compile_value_pattern(&regex::escape(&raw)) else {
                continue;
            };
            let encoded = utf8_percent_encode(&raw, URI_COMPONENT).to_string();
            let encoded_regex = if encoded != raw {
                match compile_value_pattern(&encoded_pattern(&encoded)) {
                    Some(regex) => Some(regex),
                    None => continue,
                }
            } else {
                None
            };

            max_len = max_len.max(raw.len()).max(encoded.len());
            patterns.push(plain);
            patterns.extend(encoded_regex);
            kept.push(raw);
        }

        Self {
            values: kept,
            patterns,
            max_len,
        }
    }

    /// Detects secrets in `env` and compiles them.
    pub fn from_env<'a, I, K, V>(env: I) -> Self
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: AsRef<str> + ?Sized + 'a,
        V: AsRef<str> + ?Sized + 'a,
    {
        Self::new(detect(env))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Longest byte length a masked occurrence can have, plain or encoded.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Byte offset up to which `text` can be masked and emitted while more
    /// text may still follow. No occurrence, and no prefix of one, extends
    /// past the returned offset; the rest must be prepended to the next chunk.
    pub fn split_point(&self, text: &str) -> usize {
        if self.patterns.is_empty() {
            return text.len();
        }

        let mut split = text.len().saturating_sub(self.max_len - 1);
        while !text.is_char_boundary(split) {
            split -= 1;
        }
        loop {
            let crossing = self
                .patterns
                .iter()
                .filter_map(|pattern| {
                    pattern
                        .find_iter(text)
                        .find(|m| m.start() < split && m.end() > split)
                        .map(|m| m.start())
                })
                .min();
            match crossing {
                Some(start) => split = start,
                None => return split,
            }
        }
    }

    pub fn mask<'t>(&self, text: &'t str) -> Cow<'t, str> {
        if text.is_empty() || self.patterns.is_empty() {
            return Cow::Borrowed(text);
        }

        let mut masked: Option<String> = None;
        for pattern in &self.patterns {
            let current = masked.as_deref().unwrap_or(text);
            let replaced = match pattern.replace_all(current, NoExpand(MASK)) {
                Cow::Owned(replaced) => Some(replaced),
                Cow::Borrowed(_) => None,
            };
            if replaced.is_some() {
                masked = replaced;
            }
        }
        match masked {
            Some(masked) => Cow::Owned(masked),
            None => Cow::Borrowed(text),
        }
    }
}

/// Escaped pattern for a percent-encoded value whose `%XX` hex digits match
/// in either case.
fn encoded_pattern(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut pattern = String::with_capacity(encoded.len() * 2);
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            pattern.push('%');
            for digit in [bytes[i + 1], bytes[i + 2]] {
                if digit.is_ascii_alphabetic() {
                    pattern.push('[');
                    pattern.push(digit.to_ascii_lowercase() as char);
                    pattern.push(digit.to_ascii_uppercase() as char);
                    pattern.push(']');
                } else {
                    pattern.push(digit as char);
                }
            }
            i += 3;
        } else {
            // encoded output is pure ASCII
            pattern.push_str(&regex::escape(&(bytes[i] as char).to_string()));
            i += 1;
        }
    }
    pattern
}
