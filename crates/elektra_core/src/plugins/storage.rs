//! The default storage plugin.
//!
//! Stores a key set as line-oriented UTF-8 text. The format is
//! deliberately simple:
//!
//! ```text
//! ;elektra storage v1
//! k /name\sof/key          key record, path relative to the mountpoint
//! v some\svalue            string value (omitted when empty)
//! b 0aff01                 binary value, hex encoded
//! m type long              one line per metadata entry
//! ```
//!
//! Tokens never contain raw whitespace: backslash, newline, carriage
//! return and space are escaped (`\\`, `\n`, `\r`, `\s`). Key paths use
//! the usual escaped key-name syntax on top of that.

use crate::error::{KdbError, KdbResult};
use crate::key::name::{KeyName, Namespace};
use crate::key::Key;
use crate::keyset::KeySet;
use crate::plugin::{Capabilities, PhaseContext, Plugin, PluginResult, PluginStatus};
use std::path::Path;

const HEADER: &str = ";elektra storage v1";

fn escape_token(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ' ' => out.push_str("\\s"),
            _ => out.push(c),
        }
    }
}

fn unescape_token(token: &str) -> KdbResult<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('s') => out.push(' '),
            other => {
                return Err(KdbError::validation(format!(
                    "invalid escape sequence '\\{}' in storage file",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

fn encode_hex(bytes: &[u8], out: &mut String) {
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
}

fn decode_hex(text: &str) -> KdbResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(KdbError::validation(
            "odd number of hex digits in binary value",
        ));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| KdbError::validation("invalid hex digit in binary value"))
        })
        .collect()
}

fn relative_path(key: &Key, parent: &KeyName) -> KdbResult<String> {
    let rest = key.name().strip_prefix(parent).ok_or_else(|| {
        KdbError::internal(format!(
            "key '{}' is outside the mountpoint '{}'",
            key.name(),
            parent
        ))
    })?;
    Ok(KeyName::from_parts(Namespace::Cascading, rest.iter().cloned()).to_string())
}

/// Serializes a key set relative to a parent name.
///
/// # Errors
///
/// Returns an internal error for keys outside the parent's subtree.
pub fn encode(ks: &KeySet, parent: &KeyName) -> KdbResult<String> {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');

    for key in ks.iter() {
        out.push_str("k ");
        escape_token(&relative_path(key, parent)?, &mut out);
        out.push('\n');

        if let Some(bytes) = key.as_binary() {
            out.push_str("b ");
            encode_hex(bytes, &mut out);
            out.push('\n');
        } else if !key.string_value().is_empty() {
            out.push_str("v ");
            escape_token(key.string_value(), &mut out);
            out.push('\n');
        }

        for meta in key.meta_keys().iter() {
            out.push_str("m ");
            let path = KeyName::from_parts(
                Namespace::Cascading,
                meta.name().segments().iter().cloned(),
            )
            .to_string();
            escape_token(path.trim_start_matches('/'), &mut out);
            out.push(' ');
            escape_token(meta.string_value(), &mut out);
            out.push('\n');
        }
    }

    Ok(out)
}

/// Parses a storage file into keys below a parent name.
///
/// # Errors
///
/// Returns a validation error for malformed content.
pub fn decode(text: &str, parent: &KeyName) -> KdbResult<KeySet> {
    let mut lines = text.lines();
    match lines.next() {
        Some(line) if line == HEADER => {}
        _ => {
            return Err(KdbError::validation(format!(
                "missing storage header '{HEADER}'"
            )))
        }
    }

    let mut ks = KeySet::new();
    let mut current: Option<Key> = None;

    for (number, line) in lines.enumerate() {
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let (tag, rest) = line.split_at(line.find(' ').unwrap_or(line.len()));
        let rest = rest.trim_start_matches(' ');

        match tag {
            "k" => {
                if let Some(done) = current.take() {
                    ks.append(done);
                }
                let path = unescape_token(rest)?;
                let relative = KeyName::parse(&path)
                    .map_err(|e| KdbError::validation(e.to_string()))?;
                let mut name = parent.clone();
                for segment in relative.segments() {
                    name.push(segment.clone());
                }
                let mut key = Key::new(name);
                key.set_needs_sync(false);
                current = Some(key);
            }
            "v" => {
                let key = current.as_mut().ok_or_else(|| {
                    KdbError::validation(format!("value record before key record in line {}", number + 2))
                })?;
                key.set_string(unescape_token(rest)?)?;
                key.set_needs_sync(false);
            }
            "b" => {
                let key = current.as_mut().ok_or_else(|| {
                    KdbError::validation(format!("binary record before key record in line {}", number + 2))
                })?;
                key.set_binary(decode_hex(rest)?)?;
                key.set_needs_sync(false);
            }
            "m" => {
                let key = current.as_mut().ok_or_else(|| {
                    KdbError::validation(format!("meta record before key record in line {}", number + 2))
                })?;
                let (path, value) = rest.split_once(' ').ok_or_else(|| {
                    KdbError::validation(format!("malformed meta record in line {}", number + 2))
                })?;
                let meta_name = format!("meta:/{}", unescape_token(path)?);
                key.set_meta(&meta_name, &unescape_token(value)?)?;
                key.set_needs_sync(false);
            }
            other => {
                return Err(KdbError::validation(format!(
                    "unknown record tag '{}' in line {}",
                    other,
                    number + 2
                )))
            }
        }
    }

    if let Some(done) = current.take() {
        ks.append(done);
    }
    ks.set_needs_sync(false);
    Ok(ks)
}

/// The built-in storage plugin.
///
/// Reads and writes the line-oriented text format at the storage
/// identifier the resolver placed into the parent key.
#[derive(Debug, Default)]
pub struct StoragePlugin;

impl StoragePlugin {
    /// Creates a storage plugin instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for StoragePlugin {
    fn name(&self) -> &str {
        "storage"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_get().with_set()
    }

    fn get(&mut self, ks: &mut KeySet, parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        let path = parent.string_value().to_string();
        if path.is_empty() {
            return Err(KdbError::internal(
                "storage phase reached without a resolved storage identifier",
            ));
        }

        if !Path::new(&path).exists() {
            // nothing stored yet
            return Ok(PluginStatus::Success);
        }

        let text = std::fs::read_to_string(&path)?;
        let parsed = decode(&text, parent.name())?;
        ks.append_all(&parsed);
        ks.set_needs_sync(false);
        Ok(PluginStatus::Success)
    }

    fn set(&mut self, ks: &mut KeySet, parent: &mut Key, _ctx: &PhaseContext<'_>) -> PluginResult {
        let path = parent.string_value().to_string();
        if path.is_empty() {
            return Err(KdbError::internal(
                "storage phase reached without a resolved storage identifier",
            ));
        }

        let text = encode(ks, parent.name())?;
        if let Some(dir) = Path::new(&path).parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, text)?;
        Ok(PluginStatus::Success)
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> KeyName {
        KeyName::parse("user:/app").unwrap()
    }

    #[test]
    fn round_trip_plain_keys() {
        let mut ks = KeySet::new();
        ks.append(Key::parse("user:/app/name").unwrap().with_string("hello world"));
        ks.append(Key::parse("user:/app/size").unwrap().with_string("7"));

        let text = encode(&ks, &parent()).unwrap();
        let back = decode(&text, &parent()).unwrap();

        assert_eq!(back, ks);
        assert!(!back.any_key_needs_sync());
    }

    #[test]
    fn round_trip_metadata_and_binary() {
        let mut key = Key::parse("user:/app/blob").unwrap();
        key.set_binary(vec![0x0a, 0xff, 0x01]).unwrap();
        key.set_meta("meta:/type", "octet stream").unwrap();

        let mut ks = KeySet::new();
        ks.append(key);

        let text = encode(&ks, &parent()).unwrap();
        let back = decode(&text, &parent()).unwrap();

        let name = KeyName::parse("user:/app/blob").unwrap();
        let key = back.lookup(&name).unwrap();
        assert_eq!(key.as_binary(), Some(&[0x0a, 0xff, 0x01][..]));
        assert_eq!(key.meta("meta:/type"), Some("octet stream"));
    }

    #[test]
    fn round_trip_mountpoint_root_key() {
        let mut ks = KeySet::new();
        ks.append(Key::parse("user:/app").unwrap().with_string("root"));

        let text = encode(&ks, &parent()).unwrap();
        let back = decode(&text, &parent()).unwrap();

        let name = KeyName::parse("user:/app").unwrap();
        assert_eq!(back.lookup(&name).unwrap().as_string(), Some("root"));
    }

    #[test]
    fn round_trip_special_characters() {
        let mut ks = KeySet::new();
        ks.append(
            Key::parse("user:/app/a\\/b").unwrap().with_string("line\nbreak \\ and space"),
        );

        let text = encode(&ks, &parent()).unwrap();
        let back = decode(&text, &parent()).unwrap();
        assert_eq!(back, ks);
    }

    #[test]
    fn missing_header_is_rejected() {
        assert!(decode("k /a\n", &parent()).is_err());
    }

    #[test]
    fn garbage_records_are_rejected() {
        let text = format!("{HEADER}\nx nonsense\n");
        assert!(decode(&text, &parent()).is_err());

        let text = format!("{HEADER}\nv orphan\n");
        assert!(decode(&text, &parent()).is_err());
    }

    #[test]
    fn keys_outside_the_mountpoint_fail_encode() {
        let mut ks = KeySet::new();
        ks.append(Key::parse("system:/other").unwrap());
        assert!(encode(&ks, &parent()).is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = format!("{HEADER}\n\n; a comment\nk /name\nv x\n");
        let ks = decode(&text, &parent()).unwrap();
        assert_eq!(ks.len(), 1);
    }
}
