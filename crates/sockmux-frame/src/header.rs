//! Flat key-value header table carried in every packet.
//!
//! Encoded as `key=value;` tokens. Keys and values must not contain `;` or
//! `=`: nothing is escaped, that is a protocol constraint on callers.

use std::fmt;

use tracing::debug;

/// Header key whose presence marks an application-level error response.
pub const CODE_KEY: &str = "code";

/// Header key carrying the error description of an error response.
pub const MESSAGE_KEY: &str = "message";

const TOKEN_SEPARATOR: char = ';';
const KV_SEPARATOR: char = '=';

/// Ordered key-value metadata block.
///
/// Reads return the first match. Writes are last-writer-wins per key: setting
/// a key drops every earlier occurrence and appends the new pair, leaving the
/// order of the other keys untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    entries: Vec<(String, String)>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an encoded header string. Tokens without `=` are skipped.
    pub fn parse(encoded: &str) -> Self {
        let entries = encoded
            .split(TOKEN_SEPARATOR)
            .filter(|token| !token.is_empty())
            .filter_map(|token| match token.split_once(KV_SEPARATOR) {
                Some((key, value)) => Some((key.to_string(), value.to_string())),
                None => {
                    debug!(token, "skipping header token without '='");
                    None
                }
            })
            .collect();
        Self { entries }
    }

    /// Replace the whole table with the contents of `encoded`.
    pub fn replace_with(&mut self, encoded: &str) {
        *self = Self::parse(encoded);
    }

    /// Encode as `key=value;key=value;`.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            self.entries
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum(),
        );
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push(KV_SEPARATOR);
            out.push_str(value);
            out.push(TOKEN_SEPARATOR);
        }
        out
    }

    /// Value of the first occurrence of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of `key` with form decoding applied (`+` and `%XX`).
    pub fn get_decoded(&self, key: &str) -> Option<String> {
        self.get(key).map(form_decode)
    }

    /// Set `key`, removing any prior occurrence before appending.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    /// Remove every occurrence of `key`, returning the first value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let position = self.entries.iter().position(|(k, _)| k == key)?;
        let (_, value) = self.entries.remove(position);
        self.entries.retain(|(k, _)| k != key);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for HeaderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for HeaderTable {
    fn from(encoded: &str) -> Self {
        Self::parse(encoded)
    }
}

/// Decode an `application/x-www-form-urlencoded` value.
///
/// `+` becomes a space and `%XX` becomes the byte `XX`. Malformed escapes
/// are kept verbatim; invalid UTF-8 is replaced.
pub fn form_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
