//! Format-preserving `key=value` store for `server.properties`.
//!
//! A file is parsed into a [`Template`] that keeps every comment, blank line, indentation, separator
//! and line ending, with one substitution slot per entry. Slots are named by the camel-cased key
//! (`level-name` becomes `levelName`) while the on-disk and public key stays hyphenated. Rendering
//! with unchanged values reproduces the original bytes exactly. A key may appear only once.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;

use crate::error::{Error, Result};

pub const FILE_NAME: &str = "server.properties";

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([ \t]*)([A-Za-z0-9_\-]+)([ \t]*=[ \t]*)(.*?)([ \t]*)$")
            .expect("entry regex is valid")
    })
}

fn word_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\-_]+").expect("word split regex is valid"))
}

/// Slot name used inside the template for an on-disk key.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, word) in word_split_re()
        .split(key)
        .filter(|w| !w.is_empty())
        .enumerate()
    {
        let lower = word.to_lowercase();
        if i == 0 {
            out.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out.retain(|c| c.is_ascii_alphanumeric() || c == '_');
    out
}

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!("invalid property key {key:?}")));
    }
    Ok(())
}

pub fn validate_value(value: &str) -> Result<()> {
    if let Some(c) = value.chars().find(|c| c.is_control()) {
        return Err(Error::Validation(format!(
            "property value contains non-printable character {c:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct TemplateOptions {
    pub keep_comments: bool,
    pub keep_blank_lines: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            keep_comments: true,
            keep_blank_lines: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Verbatim(String),
    Entry {
        indent: String,
        key: String,
        slot: String,
        separator: String,
        trailing: String,
        eol: String,
    },
}

struct RawLine<'a> {
    number: usize,
    body: &'a str,
    eol: &'a str,
}

fn raw_lines(raw: &str) -> impl Iterator<Item = RawLine<'_>> {
    raw.split_inclusive('\n').enumerate().map(|(i, line)| {
        let (body, eol) = if let Some(body) = line.strip_suffix("\r\n") {
            (body, "\r\n")
        } else if let Some(body) = line.strip_suffix('\n') {
            (body, "\n")
        } else {
            (line, "")
        };
        RawLine {
            number: i + 1,
            body,
            eol,
        }
    })
}

enum Parsed<'a> {
    Blank,
    Comment,
    Entry {
        indent: &'a str,
        key: &'a str,
        separator: &'a str,
        value: &'a str,
        trailing: &'a str,
    },
}

fn parse_line<'a>(line: &RawLine<'a>) -> Result<Parsed<'a>> {
    let trimmed = line.body.trim();
    if trimmed.is_empty() {
        return Ok(Parsed::Blank);
    }
    if trimmed.starts_with('#') {
        return Ok(Parsed::Comment);
    }
    let Some(caps) = entry_re().captures(line.body) else {
        return Err(Error::Validation(format!(
            "malformed line {}: {:?}",
            line.number, line.body
        )));
    };
    let part = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
    let key = part(2);
    let value = part(4);
    validate_key(key)?;
    validate_value(value)
        .map_err(|e| Error::Validation(format!("line {}: {e}", line.number)))?;
    Ok(Parsed::Entry {
        indent: part(1),
        key,
        separator: part(3),
        value,
        trailing: part(5),
    })
}

/// `base`, or `base_2`, `base_3`, ... when another key already camel-cases to it.
fn free_slot(owners: &HashMap<String, String>, base: String) -> String {
    if !owners.contains_key(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if !owners.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// The rewritable structure of a properties file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    lines: Vec<Line>,
    slots: BTreeMap<String, String>,
}

impl Template {
    pub fn parse(raw: &str, opts: TemplateOptions) -> Result<Self> {
        let mut lines = Vec::new();
        let mut slots: BTreeMap<String, String> = BTreeMap::new();
        let mut owners: HashMap<String, String> = HashMap::new();

        for line in raw_lines(raw) {
            match parse_line(&line)? {
                Parsed::Blank => {
                    if opts.keep_blank_lines {
                        lines.push(Line::Verbatim(format!("{}{}", line.body, line.eol)));
                    }
                }
                Parsed::Comment => {
                    if opts.keep_comments {
                        lines.push(Line::Verbatim(format!("{}{}", line.body, line.eol)));
                    }
                }
                Parsed::Entry {
                    indent,
                    key,
                    separator,
                    trailing,
                    ..
                } => {
                    if slots.contains_key(key) {
                        return Err(Error::Validation(format!(
                            "duplicate key {key:?} on line {}",
                            line.number
                        )));
                    }
                    let slot = free_slot(&owners, to_camel_case(key));
                    owners.insert(slot.clone(), key.to_string());
                    slots.insert(key.to_string(), slot.clone());
                    lines.push(Line::Entry {
                        indent: indent.to_string(),
                        key: key.to_string(),
                        slot,
                        separator: separator.to_string(),
                        trailing: trailing.to_string(),
                        eol: line.eol.to_string(),
                    });
                }
            }
        }

        Ok(Self { lines, slots })
    }

    /// Decodes the current values of `raw` keyed by the on-disk key.
    pub fn materialize(raw: &str) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for line in raw_lines(raw) {
            if let Parsed::Entry { key, value, .. } = parse_line(&line)?
                && values.insert(key.to_string(), value.to_string()).is_some()
            {
                return Err(Error::Validation(format!(
                    "duplicate key {key:?} on line {}",
                    line.number
                )));
            }
        }
        Ok(values)
    }

    pub fn slot(&self, key: &str) -> Option<&str> {
        self.slots.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Regenerates the file from slot values. Slots missing from `vars` render empty.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Verbatim(text) => out.push_str(text),
                Line::Entry {
                    indent,
                    key,
                    slot,
                    separator,
                    trailing,
                    eol,
                } => {
                    out.push_str(indent);
                    out.push_str(key);
                    out.push_str(separator);
                    if let Some(v) = vars.get(slot) {
                        out.push_str(v);
                    }
                    out.push_str(trailing);
                    out.push_str(eol);
                }
            }
        }
        out
    }
}

fn default_filters() -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "gamemode".to_string(),
        vec![
            "survival".to_string(),
            "creative".to_string(),
            "adventure".to_string(),
        ],
    )])
}

/// A server's `server.properties`, parsed once and rewritten in place.
#[derive(Debug, Clone)]
pub struct ServerProperties {
    path: PathBuf,
    template: Template,
    values: BTreeMap<String, String>,
    filters: HashMap<String, Vec<String>>,
}

impl ServerProperties {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::io_at("read", &path, e))?;
        Self::parse(path, &raw)
    }

    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            template: Template::parse(raw, TemplateOptions::default())?,
            values: Template::materialize(raw)?,
            filters: default_filters(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn all(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn allowed_values(&self, key: &str) -> Option<&[String]> {
        self.filters.get(key).map(Vec::as_slice)
    }

    pub fn validate(&self, key: &str, value: &str) -> Result<()> {
        if self.template.slot(key).is_none() {
            return Err(Error::Validation(format!("unknown property {key:?}")));
        }
        validate_value(value)?;
        if let Some(allowed) = self.filters.get(key)
            && !allowed.iter().any(|a| a == value)
        {
            return Err(Error::Validation(format!(
                "{key} must be one of {}, got {value:?}",
                allowed.join(", ")
            )));
        }
        Ok(())
    }

    pub async fn set(&mut self, key: &str, value: &str, write: bool) -> Result<()> {
        self.set_all([(key, value)], write).await
    }

    /// Applies every pair or none of them, then writes once.
    pub async fn set_all<I, K, V>(&mut self, pairs: I, write: bool) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for (k, v) in &pairs {
            self.validate(k, v)?;
        }
        let mut next = self.values.clone();
        next.extend(pairs);
        // Memory only changes once the file does.
        if write {
            self.write_values(&next).await?;
        }
        self.values = next;
        Ok(())
    }

    pub fn render(&self) -> String {
        self.render_values(&self.values)
    }

    fn render_values(&self, values: &BTreeMap<String, String>) -> String {
        let vars: HashMap<String, String> = values
            .iter()
            .filter_map(|(k, v)| Some((self.template.slot(k)?.to_string(), v.clone())))
            .collect();
        self.template.render(&vars)
    }

    pub async fn write(&self) -> Result<()> {
        self.write_values(&self.values).await
    }

    async fn write_values(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let rendered = self.render_values(values);
        let tmp = self.path.with_extension("properties.tmp");
        tokio::fs::write(&tmp, rendered.as_bytes())
            .await
            .map_err(|e| Error::io_at("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::io_at("replace", &self.path, e))?;
        Ok(())
    }

    pub fn server_name(&self) -> Option<&str> {
        self.get("server-name")
    }

    pub fn level_name(&self) -> Option<&str> {
        self.get("level-name")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "server-name=Dedicated Server\n# Used as the server name\n# Allowed values: Any string without semicolon symbol.\n\ngamemode=survival\n  difficulty = easy  \r\nlevel-name=Bedrock level\nmax-players=10";

    #[test]
    fn camel_case_slots() {
        assert_eq!(to_camel_case("server-name"), "serverName");
        assert_eq!(to_camel_case("allow_cheats"), "allowCheats");
        assert_eq!(to_camel_case("level seed"), "levelSeed");
        assert_eq!(to_camel_case("SERVER-PORT-v6"), "serverPortV6");
        assert_eq!(to_camel_case("2fa-mode"), "_2faMode");
    }

    #[test]
    fn unchanged_render_is_byte_identical() {
        let props = ServerProperties::parse("server.properties", SAMPLE).unwrap();
        assert_eq!(props.render(), SAMPLE);
        assert_eq!(props.get("difficulty"), Some("easy"));
        assert_eq!(props.get("server-name"), Some("Dedicated Server"));
    }

    #[test]
    fn malformed_line_fails_parse() {
        let err = ServerProperties::parse("p", "ok=1\nthis line has no separator\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn non_printable_value_fails_parse() {
        let err = ServerProperties::parse("p", "motd=a\u{7}b\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn template_can_drop_comments() {
        let t = Template::parse(
            SAMPLE,
            TemplateOptions {
                keep_comments: false,
                keep_blank_lines: false,
            },
        )
        .unwrap();
        let vars = HashMap::from([("gamemode".to_string(), "creative".to_string())]);
        let out = t.render(&vars);
        assert!(!out.contains('#'));
        assert!(out.contains("gamemode=creative\n"));
    }

    #[tokio::test]
    async fn unknown_key_never_mutates() {
        let mut props = ServerProperties::parse("server.properties", SAMPLE).unwrap();
        let before = props.all().clone();
        let err = props.set("no-such-key", "1", false).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(props.all(), &before);
    }

    #[tokio::test]
    async fn filtered_value_is_rejected() {
        let mut props = ServerProperties::parse("server.properties", SAMPLE).unwrap();
        assert!(props.set("gamemode", "spectator", false).await.is_err());
        assert_eq!(props.get("gamemode"), Some("survival"));
        props.set("gamemode", "creative", false).await.unwrap();
        assert_eq!(props.get("gamemode"), Some("creative"));
    }

    #[tokio::test]
    async fn set_all_is_all_or_nothing() {
        let mut props = ServerProperties::parse("server.properties", SAMPLE).unwrap();
        let err = props
            .set_all([("max-players", "20"), ("gamemode", "hardcore")], false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(props.get("max-players"), Some("10"));
    }

    #[tokio::test]
    async fn write_through_changes_only_the_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILE_NAME);
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let mut props = ServerProperties::open(&path).await.unwrap();
        props.set("difficulty", "hard", true).await.unwrap();

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(on_disk, SAMPLE.replace("difficulty = easy", "difficulty = hard"));
        let reopened = ServerProperties::open(&path).await.unwrap();
        assert_eq!(reopened.get("difficulty"), Some("hard"));
    }

    #[test]
    fn duplicate_keys_fail_parse() {
        let err = ServerProperties::parse("p", "max-players=10\nmax-players=20\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(Template::materialize("a=1\na=2\n").is_err());
    }

    #[test]
    fn colliding_slots_get_distinct_names() {
        let raw = "level-name=A\nlevel_name=B\n";
        let props = ServerProperties::parse("p", raw).unwrap();
        assert_eq!(props.template.slot("level-name"), Some("levelName"));
        assert_eq!(props.template.slot("level_name"), Some("levelName_2"));
        assert_eq!(props.render(), raw);
    }

    #[tokio::test]
    async fn failed_write_leaves_values_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join(FILE_NAME);
        let mut props = ServerProperties::parse(&path, SAMPLE).unwrap();

        let err = props.set("difficulty", "hard", true).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(props.get("difficulty"), Some("easy"));
        assert_eq!(props.render(), SAMPLE);
    }
}
