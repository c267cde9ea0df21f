//! INI-style configuration loader.
//!
//! Syntax: `[section]` or `[section:key]` headers, `name = value` options,
//! `#`/`;` comments, CRLF and LF line endings. Options in `[DEFAULT]`
//! propagate as fall-through values for every other section. Option values
//! may reference other options of the same section (or DEFAULT) with
//! `{placeholder}`, substituted recursively.

pub mod options;

use hashbrown::HashSet;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_SECTION: &str = "DEFAULT";

/// substitution depth guard; a deeper chain is treated as a cycle.
const MAX_INTERPOLATION_DEPTH: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    RuntimeError(String),
    #[error("{0}")]
    Undefined(String),
}

fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// One `[name]` / `[name:key]` block with its ordered options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSection {
    pub name: String,
    pub key: Option<String>,
    options: Vec<(String, String)>,
}

impl ConfigSection {
    fn raw(&self, option: &str) -> Option<&str> {
        let wanted = option.to_ascii_lowercase();
        self.options
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, value)| value.as_str())
    }

    fn set(&mut self, option: String, value: String) {
        match self.options.iter_mut().find(|(name, _)| *name == option) {
            Some((_, old)) => *old = value,
            None => self.options.push((option, value)),
        }
    }

    pub fn option_names(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Display for ConfigSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "[{}:{}]", self.name, key),
            None => write!(f, "[{}]", self.name),
        }
    }
}

/// A section resolved against the config's DEFAULT fall-through.
#[derive(Debug, Clone, Copy)]
pub struct SectionView<'a> {
    section: &'a ConfigSection,
    defaults: &'a ConfigSection,
}

impl<'a> SectionView<'a> {
    pub fn name(&self) -> &str {
        &self.section.name
    }

    pub fn key(&self) -> Option<&str> {
        self.section.key.as_deref()
    }

    pub fn section(&self) -> &'a ConfigSection {
        self.section
    }

    /// Option value with `{placeholder}` substitution applied.
    pub fn get(&self, option: &str) -> Result<Option<String>, ConfigError> {
        let raw = match self.section.raw(option).or_else(|| self.defaults.raw(option)) {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let mut seen = HashSet::new();
        seen.insert(option.to_ascii_lowercase());
        self.interpolate(raw, &mut seen, 0).map(Some)
    }

    fn lookup(&self, option: &str) -> Option<&str> {
        self.section.raw(option).or_else(|| self.defaults.raw(option))
    }

    fn interpolate(
        &self,
        value: &str,
        seen: &mut HashSet<String>,
        depth: usize,
    ) -> Result<String, ConfigError> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(ConfigError::Syntax(
                "recursive substitution of config option values".to_string(),
            ));
        }

        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(open) = rest.find('{') {
            let (head, tail) = rest.split_at(open);
            out.push_str(head);
            match tail[1..].find('}') {
                Some(close) => {
                    let placeholder = &tail[1..1 + close];
                    let name = placeholder.to_ascii_lowercase();
                    if !is_valid_identifier(placeholder) {
                        // not a substitutable name; keep it literally.
                        out.push_str(&tail[..close + 2]);
                    } else if let Some(inner) = self.lookup(&name) {
                        if !seen.insert(name.clone()) {
                            return Err(ConfigError::Syntax(format!(
                                "cycle in substitution of config option '{placeholder}'"
                            )));
                        }
                        let substituted = self.interpolate(inner, seen, depth + 1)?;
                        seen.remove(&name);
                        out.push_str(&substituted);
                    } else {
                        out.push_str(&tail[..close + 2]);
                    }
                    rest = &tail[close + 2..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// The parsed configuration tree. Repeated `read_*` calls merge with
/// last-wins semantics per (section, key, option).
#[derive(Debug, Clone, Default)]
pub struct Config {
    defaults: ConfigSection,
    sections: Vec<ConfigSection>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            defaults: ConfigSection {
                name: DEFAULT_SECTION.to_string(),
                ..Default::default()
            },
            sections: Vec::new(),
        }
    }

    pub fn read_file(&mut self, path: &std::path::Path) -> Result<(), ConfigError> {
        let text = fs_err::read_to_string(path)
            .map_err(|e| ConfigError::RuntimeError(format!("{}: {e}", path.display())))?;
        self.read_str(&text)
    }

    pub fn read_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let parsed = parse(text)?;
        for section in parsed {
            if section.name == DEFAULT_SECTION {
                for (name, value) in section.options {
                    self.defaults.set(name, value);
                }
                continue;
            }
            match self
                .sections
                .iter_mut()
                .find(|s| s.name == section.name && section_key_eq(&s.key, &section.key))
            {
                Some(existing) => {
                    for (name, value) in section.options {
                        existing.set(name, value);
                    }
                }
                None => self.sections.push(section),
            }
        }
        Ok(())
    }

    pub fn sections(&self) -> impl Iterator<Item = SectionView<'_>> {
        self.sections.iter().map(|section| SectionView {
            section,
            defaults: &self.defaults,
        })
    }

    pub fn get(&self, name: &str, key: Option<&str>) -> Option<SectionView<'_>> {
        self.sections
            .iter()
            .find(|s| s.name == name && section_key_eq_str(&s.key, key))
            .map(|section| SectionView {
                section,
                defaults: &self.defaults,
            })
    }

    pub fn defaults(&self) -> &ConfigSection {
        &self.defaults
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

// section keys compare case-insensitively, section names do not.
fn section_key_eq(a: &Option<String>, b: &Option<String>) -> bool {
    section_key_eq_str(a, b.as_deref())
}

fn section_key_eq_str(a: &Option<String>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn parse(text: &str) -> Result<Vec<ConfigSection>, ConfigError> {
    let mut sections: Vec<ConfigSection> = Vec::new();
    let mut current: Option<ConfigSection> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line).trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let header = header.strip_suffix(']').ok_or_else(|| {
                ConfigError::Syntax(format!("line {}: malformed section header", lineno + 1))
            })?;
            let (name, key) = match header.split_once(':') {
                Some((name, key)) => (name, Some(key)),
                None => (header, None),
            };
            if !is_valid_identifier(name) {
                return Err(ConfigError::Syntax(format!(
                    "line {}: invalid section name '{name}'",
                    lineno + 1
                )));
            }
            if let Some(key) = key {
                if !is_valid_identifier(key) {
                    return Err(ConfigError::Syntax(format!(
                        "line {}: invalid section key '{key}'",
                        lineno + 1
                    )));
                }
            }
            let section = ConfigSection {
                name: name.to_string(),
                key: key.map(|k| k.to_string()),
                options: Vec::new(),
            };
            if sections
                .iter()
                .chain(current.as_ref())
                .any(|s| s.name == section.name && section_key_eq(&s.key, &section.key))
            {
                return Err(ConfigError::Syntax(format!(
                    "line {}: duplicate section {section}",
                    lineno + 1
                )));
            }
            if let Some(done) = current.replace(section) {
                sections.push(done);
            }
            continue;
        }

        let (name, value) = line.split_once('=').ok_or_else(|| {
            ConfigError::Syntax(format!(
                "line {}: expected 'option = value', got '{line}'",
                lineno + 1
            ))
        })?;
        let name = name.trim().to_ascii_lowercase();
        if !is_valid_identifier(&name) {
            return Err(ConfigError::Syntax(format!(
                "line {}: invalid option name '{name}'",
                lineno + 1
            )));
        }
        let section = current.as_mut().ok_or_else(|| {
            ConfigError::Syntax(format!(
                "line {}: option '{name}' outside of any section",
                lineno + 1
            ))
        })?;
        if section.raw(&name).is_some() {
            return Err(ConfigError::Syntax(format!(
                "line {}: option '{name}' already defined in {section}",
                lineno + 1
            )));
        }
        section.set(name, value.trim().to_string());
    }

    if let Some(done) = current {
        sections.push(done);
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_sections() {
        let mut config = Config::new();
        config
            .read_str("[routing]\nbind_port = 6446\n\n[routing:ro]\nbind_port=6447\n")
            .unwrap();

        let rw = config.get("routing", None).unwrap();
        assert_eq!(rw.get("bind_port").unwrap().as_deref(), Some("6446"));
        let ro = config.get("routing", Some("ro")).unwrap();
        assert_eq!(ro.get("bind_port").unwrap().as_deref(), Some("6447"));
        // section keys are case-insensitive.
        assert!(config.get("routing", Some("RO")).is_some());
    }

    #[test]
    fn default_fallthrough() {
        let mut config = Config::new();
        config
            .read_str("[DEFAULT]\nconnect_timeout = 5\n[routing]\nbind_port = 6446\n")
            .unwrap();
        let section = config.get("routing", None).unwrap();
        assert_eq!(section.get("connect_timeout").unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn comments_and_crlf() {
        let mut config = Config::new();
        config
            .read_str("# leading comment\r\n[routing]\r\n; another\r\nbind_port = 6446\r\n")
            .unwrap();
        let section = config.get("routing", None).unwrap();
        assert_eq!(section.get("bind_port").unwrap().as_deref(), Some("6446"));
    }

    #[test]
    fn placeholder_substitution() {
        let mut config = Config::new();
        config
            .read_str(
                "[DEFAULT]\nbasedir = /opt/router\n[logger]\nlogdir = {basedir}/log\nfile = {logdir}/router.log\n",
            )
            .unwrap();
        let section = config.get("logger", None).unwrap();
        assert_eq!(
            section.get("file").unwrap().as_deref(),
            Some("/opt/router/log/router.log")
        );
    }

    #[test]
    fn unknown_placeholder_stays_literal() {
        let mut config = Config::new();
        config.read_str("[s]\nopt = {nope}/x\n").unwrap();
        let section = config.get("s", None).unwrap();
        assert_eq!(section.get("opt").unwrap().as_deref(), Some("{nope}/x"));
    }

    #[test]
    fn placeholder_cycle_is_error() {
        let mut config = Config::new();
        config.read_str("[s]\na = {b}\nb = {a}\n").unwrap();
        let section = config.get("s", None).unwrap();
        assert!(section.get("a").is_err());
    }

    #[test]
    fn duplicate_option_is_error() {
        let mut config = Config::new();
        let err = config.read_str("[s]\na = 1\na = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }

    #[test]
    fn duplicate_section_is_error() {
        let mut config = Config::new();
        let err = config.read_str("[s]\na = 1\n[s]\nb = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }

    #[test]
    fn invalid_section_name_is_error() {
        let mut config = Config::new();
        assert!(config.read_str("[bad-name]\n").is_err());
        assert!(config.read_str("[s:bad key]\n").is_err());
    }

    #[test]
    fn repeated_reads_merge_last_wins() {
        let mut config = Config::new();
        config.read_str("[s]\na = 1\nb = 2\n").unwrap();
        config.read_str("[s]\na = 3\n").unwrap();
        let section = config.get("s", None).unwrap();
        assert_eq!(section.get("a").unwrap().as_deref(), Some("3"));
        assert_eq!(section.get("b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn option_names_are_case_insensitive() {
        let mut config = Config::new();
        config.read_str("[s]\nBind_Port = 7\n").unwrap();
        let section = config.get("s", None).unwrap();
        assert_eq!(section.get("bind_port").unwrap().as_deref(), Some("7"));
    }
}
