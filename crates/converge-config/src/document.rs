//! Templated configuration document
//!
//! A [`ConfigDocument`] keeps the raw text of a YAML template next to its
//! parsed value. Mutations locate the target key in the block layout of the
//! text and splice the rendered value into that span, so comments and every
//! byte outside the edited key survive. Each splice is re-parsed and compared
//! with the expected structural value. When the layout cannot be edited in
//! place (flow mappings, anchors, multi-line scalars) the edit is refused
//! with [`ConfigError::UnsupportedLayout`] and the text is left as it was.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut doc = ConfigDocument::load("local.values.yml")?;
//! doc.set(&KeyPath::parse("cache.timeout")?, Value::from(60))?;
//! doc.save()?;
//! ```

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Dotted path to a key inside a document (`datasource.pool.max_size`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// Parse dot notation
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidKeyPath`] for an empty path or an empty segment.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let segments: Vec<String> = text.split('.').map(str::to_string).collect();
        if text.is_empty() || segments.iter().any(String::is_empty) {
            return Err(ConfigError::InvalidKeyPath(text.to_string()));
        }
        Ok(Self(segments))
    }

    /// Path segments, outermost first
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` names this key or one of its ancestors
    #[must_use]
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    fn prefix(&self, len: usize) -> String {
        if len == 0 {
            return "<root>".to_string();
        }
        self.0[..len].join(".")
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for KeyPath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parsed template plus the exact text it came from
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    path: PathBuf,
    text: String,
    value: Value,
}

impl ConfigDocument {
    /// Read and parse a document from disk
    ///
    /// # Errors
    /// [`ConfigError::SourceNotFound`] when the file is absent,
    /// [`ConfigError::MalformedDocument`] when it does not parse.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::SourceNotFound(path.to_path_buf()));
            }
            Err(err) => return Err(ConfigError::io(path, err)),
        };
        Self::parse(path, text)
    }

    /// Parse a document from text already in memory
    ///
    /// # Errors
    /// [`ConfigError::MalformedDocument`] when the text is not a YAML mapping.
    pub fn parse(path: impl Into<PathBuf>, text: impl Into<String>) -> ConfigResult<Self> {
        let path = path.into();
        let text = text.into();
        let value = parse_value(&path, &text)?;
        Ok(Self { path, text, value })
    }

    /// File the document was read from and will be saved to
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current serialized form
    #[inline]
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Current structural value
    #[inline]
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Value at key path, if present
    #[must_use]
    pub fn get(&self, key: &KeyPath) -> Option<&Value> {
        let mut current = &self.value;
        for segment in key.segments() {
            match current {
                Value::Mapping(map) => current = map.get(segment.as_str())?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Set the value at key path, inserting intermediate mappings as needed
    ///
    /// Only the edited key's span changes. On error the document is left
    /// as it was.
    ///
    /// # Errors
    /// [`ConfigError::PathBlocked`] when an ancestor is not a mapping,
    /// [`ConfigError::UnsupportedLayout`] when the key cannot be spliced in
    /// place without touching other bytes.
    pub fn set(&mut self, key: &KeyPath, value: Value) -> ConfigResult<()> {
        let mut expected = self.value.clone();
        set_structural(&mut expected, key, value.clone())?;

        let text = splice(&self.text, key, &value)
            .filter(|candidate| {
                parse_value(&self.path, candidate).is_ok_and(|parsed| parsed == expected)
            })
            .ok_or_else(|| ConfigError::UnsupportedLayout {
                path: self.path.clone(),
                key: key.to_string(),
            })?;

        self.text = text;
        self.value = expected;
        Ok(())
    }

    /// Write the document atomically (temp file in the same directory, then rename)
    ///
    /// # Errors
    /// [`ConfigError::Io`] when the temp file cannot be written or renamed.
    pub fn save(&self) -> ConfigResult<()> {
        write_atomic(&self.path, self.text.as_bytes())
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> ConfigResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| ConfigError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| ConfigError::io(path, e))?;
    tmp.persist(path).map_err(|e| ConfigError::io(path, e.error))?;
    Ok(())
}

fn parse_value(path: &Path, text: &str) -> ConfigResult<Value> {
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| ConfigError::malformed(path, e.to_string()))?;
    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        _ => Err(ConfigError::malformed(path, "document root must be a mapping")),
    }
}

fn set_structural(root: &mut Value, key: &KeyPath, value: Value) -> ConfigResult<()> {
    let segments = key.segments();
    let mut current = root;
    for (depth, segment) in segments.iter().enumerate() {
        let blocked = || ConfigError::PathBlocked {
            key: key.to_string(),
            ancestor: key.prefix(depth),
        };
        let Value::Mapping(map) = current else {
            return Err(blocked());
        };
        let k = Value::String(segment.clone());
        if depth + 1 == segments.len() {
            map.insert(k, value);
            return Ok(());
        }
        if !map.contains_key(&k) {
            map.insert(k.clone(), Value::Mapping(Mapping::new()));
        }
        current = map.get_mut(&k).ok_or_else(blocked)?;
    }
    Err(ConfigError::InvalidKeyPath(key.to_string()))
}

// ----------------------------------------------------------------------------
// Block layout
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inline {
    Empty,
    Scalar,
    /// `|`, `>`, flow collections, anchors, aliases and tags
    Opaque,
}

#[derive(Debug, Clone)]
struct LayoutEntry {
    path: Vec<String>,
    indent: usize,
    value_start: usize,
    value_end: usize,
    block_end: usize,
    child_indent: Option<usize>,
    inline: Inline,
    opaque: bool,
}

enum LineKind<'a> {
    Trivia,
    SeqItem,
    Other,
    Key {
        key: &'a str,
        value_start: usize,
        value_end: usize,
        inline: Inline,
    },
}

fn scan(text: &str) -> Vec<LayoutEntry> {
    let mut entries: Vec<LayoutEntry> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut offset = 0;

    for raw in text.split_inclusive('\n') {
        let start = offset;
        offset += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']);
        let end = start + line.len();
        let body = line.trim_start_matches(' ');
        let indent = line.len() - body.len();
        let kind = classify(body, start + indent);
        if matches!(kind, LineKind::Trivia) {
            continue;
        }

        while let Some(&top) = stack.last() {
            let entry = &entries[top];
            let inside = indent > entry.indent
                || (indent == entry.indent
                    && matches!(kind, LineKind::SeqItem)
                    && entry.inline == Inline::Empty);
            if inside {
                break;
            }
            stack.pop();
        }
        for &idx in &stack {
            entries[idx].block_end = end;
        }
        if stack.last().is_some_and(|&top| entries[top].opaque) {
            continue;
        }

        match kind {
            LineKind::Trivia => {}
            LineKind::SeqItem | LineKind::Other => {
                if let Some(&top) = stack.last() {
                    entries[top].opaque = true;
                }
            }
            LineKind::Key {
                key,
                value_start,
                value_end,
                inline,
            } => {
                let mut path: Vec<String> =
                    stack.last().map(|&top| entries[top].path.clone()).unwrap_or_default();
                path.push(key.to_string());
                if let Some(&top) = stack.last() {
                    entries[top].child_indent.get_or_insert(indent);
                }
                entries.push(LayoutEntry {
                    path,
                    indent,
                    value_start,
                    value_end,
                    block_end: end,
                    child_indent: None,
                    inline,
                    opaque: inline == Inline::Opaque,
                });
                stack.push(entries.len() - 1);
            }
        }
    }
    entries
}

fn classify(body: &str, body_start: usize) -> LineKind<'_> {
    if body.is_empty()
        || body.starts_with('#')
        || body == "---"
        || body.starts_with("--- ")
        || body == "..."
    {
        return LineKind::Trivia;
    }
    if body == "-" || body.starts_with("- ") {
        return LineKind::SeqItem;
    }
    let Some((key, colon)) = split_key(body) else {
        return LineKind::Other;
    };
    let after = &body[colon + 1..];
    let rest = after.trim_start_matches(' ');
    let value_offset = colon + 1 + (after.len() - rest.len());
    let value = strip_comment(rest).trim_end();
    let inline = match value.chars().next() {
        None => Inline::Empty,
        Some('|' | '>' | '{' | '[' | '&' | '*' | '!') => Inline::Opaque,
        Some(_) => Inline::Scalar,
    };
    LineKind::Key {
        key,
        value_start: body_start + value_offset,
        value_end: body_start + value_offset + value.len(),
        inline,
    }
}

/// Split `key: value` into the unquoted key and the byte index of its colon
fn split_key(body: &str) -> Option<(&str, usize)> {
    let first = body.chars().next()?;
    if matches!(first, '"' | '\'') {
        let close = body[1..].find(first)? + 1;
        let after = &body[close + 1..];
        let colon = close + 1 + after.find(|c: char| c != ' ')?;
        return (body[colon..].starts_with(':') && is_key_terminator(body, colon))
            .then(|| (&body[1..close], colon));
    }
    if matches!(first, '{' | '[' | '&' | '*' | '!' | '|' | '>' | '?' | '%' | '@' | '`') {
        return None;
    }
    let colon = body
        .char_indices()
        .find(|&(i, c)| c == ':' && is_key_terminator(body, i))
        .map(|(i, _)| i)?;
    let key = body[..colon].trim_end();
    if key.is_empty() || key.contains(" #") {
        return None;
    }
    Some((key, colon))
}

fn is_key_terminator(body: &str, colon: usize) -> bool {
    matches!(body[colon + 1..].chars().next(), None | Some(' ' | '\t'))
}

fn strip_comment(value: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut prev_space = true;
    for (i, c) in value.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') if prev_space => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '#') if prev_space => return &value[..i],
            _ => {}
        }
        prev_space = c == ' ' || c == '\t';
    }
    value
}

// ----------------------------------------------------------------------------
// Splicing
// ----------------------------------------------------------------------------

fn splice(text: &str, key: &KeyPath, value: &Value) -> Option<String> {
    let entries = scan(text);
    let segments = key.segments();
    if let Some(entry) = entries.iter().find(|e| e.path == segments) {
        return replace_value(text, entry, value);
    }

    let ancestor = (1..segments.len())
        .rev()
        .find_map(|n| entries.iter().find(|e| e.path[..] == segments[..n]).map(|e| (e, n)));
    match ancestor {
        Some((entry, depth)) => {
            if entry.opaque || entry.inline != Inline::Empty {
                return None;
            }
            let indent = entry.child_indent.unwrap_or(entry.indent + 2);
            let block = render_nested(&segments[depth..], value, indent)?;
            let mut out = String::with_capacity(text.len() + block.len() + 1);
            out.push_str(&text[..entry.block_end]);
            out.push('\n');
            out.push_str(&block);
            out.push_str(&text[entry.block_end..]);
            Some(out)
        }
        None => {
            let block = render_nested(segments, value, 0)?;
            let mut out = text.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&block);
            out.push('\n');
            Some(out)
        }
    }
}

fn replace_value(text: &str, entry: &LayoutEntry, value: &Value) -> Option<String> {
    if entry.inline == Inline::Opaque {
        return None;
    }
    let mut out = String::with_capacity(text.len());
    match render(value)? {
        Rendered::Inline(scalar) => {
            let head = &text[..entry.value_start];
            out.push_str(head);
            if !head.ends_with(' ') {
                out.push(' ');
            }
            out.push_str(&scalar);
            let tail = if entry.inline == Inline::Scalar && entry.child_indent.is_none() {
                entry.value_end
            } else {
                entry.block_end
            };
            out.push_str(&text[tail..]);
        }
        Rendered::Block(block) => {
            let indent = entry.child_indent.unwrap_or(entry.indent + 2);
            out.push_str(text[..entry.value_start].trim_end_matches(' '));
            out.push('\n');
            out.push_str(&indent_block(&block, indent));
            out.push_str(&text[entry.block_end..]);
        }
    }
    Some(out)
}

enum Rendered {
    Inline(String),
    Block(String),
}

fn render(value: &Value) -> Option<Rendered> {
    let text = serde_yaml::to_string(value).ok()?;
    let text = text.strip_suffix('\n').unwrap_or(&text).to_string();
    let collection = matches!(value, Value::Mapping(m) if !m.is_empty())
        || matches!(value, Value::Sequence(s) if !s.is_empty());
    if collection {
        Some(Rendered::Block(text))
    } else if text.contains('\n') {
        None
    } else {
        Some(Rendered::Inline(text))
    }
}

fn render_nested(segments: &[String], value: &Value, indent: usize) -> Option<String> {
    let (last, parents) = segments.split_last()?;
    let mut out = String::new();
    let mut pad = indent;
    for segment in parents {
        out.push_str(&" ".repeat(pad));
        out.push_str(&render_key(segment)?);
        out.push_str(":\n");
        pad += 2;
    }
    out.push_str(&" ".repeat(pad));
    out.push_str(&render_key(last)?);
    out.push(':');
    match render(value)? {
        Rendered::Inline(scalar) => {
            out.push(' ');
            out.push_str(&scalar);
        }
        Rendered::Block(block) => {
            out.push('\n');
            out.push_str(&indent_block(&block, pad + 2));
        }
    }
    Some(out)
}

fn render_key(segment: &str) -> Option<String> {
    let plain = segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if plain {
        return Some(segment.to_string());
    }
    let text = serde_yaml::to_string(&Value::String(segment.to_string())).ok()?;
    Some(text.trim_end().to_string())
}

fn indent_block(block: &str, indent: usize) -> String {
    let pad = " ".repeat(indent);
    block
        .lines()
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(path: &str) -> KeyPath {
        KeyPath::parse(path).unwrap()
    }

    fn doc(text: &str) -> ConfigDocument {
        ConfigDocument::parse("local.values.yml", text).unwrap()
    }

    #[test]
    fn key_path_rejects_empty_segments() {
        assert!(KeyPath::parse("").is_err());
        assert!(KeyPath::parse("cache..timeout").is_err());
        assert_eq!(key("cache.timeout").segments(), ["cache", "timeout"]);
    }

    #[test]
    fn replaces_scalar_and_keeps_comments() {
        let mut d = doc("# Local values\nserver:\n  port: 8080 # app port\ncache:\n  timeout: 30 # seconds\n  size: 100\n");
        d.set(&key("cache.timeout"), Value::from(60)).unwrap();
        assert_eq!(
            d.text(),
            "# Local values\nserver:\n  port: 8080 # app port\ncache:\n  timeout: 60 # seconds\n  size: 100\n"
        );
        assert_eq!(d.get(&key("cache.timeout")), Some(&Value::from(60)));
    }

    #[test]
    fn inserts_missing_leaf_under_existing_parent() {
        let mut d = doc("cache:\n  size: 100\nserver:\n  port: 8080\n");
        d.set(&key("cache.timeout"), Value::from(45)).unwrap();
        assert_eq!(d.text(), "cache:\n  size: 100\n  timeout: 45\nserver:\n  port: 8080\n");
    }

    #[test]
    fn inserts_new_root_section() {
        let mut d = doc("server:\n  port: 8080\n");
        d.set(&key("datasource.pool.max_size"), Value::from(20)).unwrap();
        assert_eq!(
            d.text(),
            "server:\n  port: 8080\ndatasource:\n  pool:\n    max_size: 20\n"
        );
    }

    #[test]
    fn replaces_subtree() {
        let mut d = doc("redis:\n  master:\n    host: redis.internal\n    port: 6379\nother: 1\n");
        let value: Value = serde_yaml::from_str("master:\n  host: localhost\n  port: 6379\n").unwrap();
        d.set(&key("redis"), value).unwrap();
        assert_eq!(
            d.text(),
            "redis:\n  master:\n    host: localhost\n    port: 6379\nother: 1\n"
        );
    }

    #[test]
    fn sequence_items_do_not_shadow_root_keys() {
        let mut d = doc("servers:\n  - name: a\n    port: 1\nport: 2\n");
        d.set(&key("port"), Value::from(3)).unwrap();
        assert_eq!(d.text(), "servers:\n  - name: a\n    port: 1\nport: 3\n");
    }

    #[test]
    fn scalar_ancestor_blocks_nested_set() {
        let mut d = doc("cache: 30\n");
        let err = d.set(&key("cache.timeout"), Value::from(5)).unwrap_err();
        assert!(matches!(err, ConfigError::PathBlocked { .. }));
        assert_eq!(d.text(), "cache: 30\n");
    }

    #[test]
    fn flow_mapping_is_left_untouched() {
        let original = "# keep me\ncache: {size: 1}\nother: 'x'\n";
        let mut d = doc(original);
        let err = d.set(&key("cache.timeout"), Value::from(5)).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedLayout { .. }));
        assert!(err.is_skippable());
        assert_eq!(d.text(), original);
        assert_eq!(d.get(&key("cache.timeout")), None);
    }

    #[test]
    fn block_scalar_is_left_untouched() {
        let original = "banner: |\n  hello\n# trailing\n";
        let mut d = doc(original);
        let err = d.set(&key("banner"), Value::from("bye")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedLayout { .. }));
        assert_eq!(d.text(), original);
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(matches!(
            ConfigDocument::parse("x.yml", "a: [1, 2\n"),
            Err(ConfigError::MalformedDocument { .. })
        ));
        assert!(matches!(
            ConfigDocument::parse("x.yml", "- a\n- b\n"),
            Err(ConfigError::MalformedDocument { .. })
        ));
    }

    #[test]
    fn missing_file_is_source_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigDocument::load(dir.path().join("absent.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::SourceNotFound(_)));
    }

    #[test]
    fn save_writes_current_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.values.yml");
        std::fs::write(&path, "cache:\n  timeout: 30\n").unwrap();
        let mut d = ConfigDocument::load(&path).unwrap();
        d.set(&key("cache.timeout"), Value::from(90)).unwrap();
        d.save().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "cache:\n  timeout: 90\n");
    }
}
