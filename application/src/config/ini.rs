//! A small INI reader compatible with the subset of oslo.config syntax used by `stories.conf`.
use std::path::Path;

use super::ConfigError;

/// The name of the section that every other section falls back to.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Parsed contents of one or more INI files, in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ini {
    sections: Vec<IniSection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IniSection {
    name: String,
    /// Normalized key, plus every value assigned to it in order.
    entries: Vec<(String, Vec<String>)>,
}

impl IniSection {
    fn new(name: String) -> Self {
        Self {
            name,
            entries: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// All values assigned to this key, oldest first.
    pub fn values(&self, key: &str) -> Option<&[String]> {
        let key = normalize_key(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// The last value assigned to this key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values(key)
            .and_then(|v| v.last())
            .map(|s| s.as_str())
    }

    fn push(&mut self, key: String, value: String) {
        if let Some((_, values)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            values.push(value);
        } else {
            self.entries.push((key, vec![value]));
        }
    }

    fn last_value_mut(&mut self, key: &str) -> Option<&mut String> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.last_mut())
    }
}

/// Keys are matched case-insensitively and treat `-` and `_` as equivalent.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('-', "_")
}

fn normalize_section(name: &str) -> String {
    let name = name.trim();
    if name.eq_ignore_ascii_case(DEFAULT_SECTION) {
        DEFAULT_SECTION.to_owned()
    } else {
        name.to_owned()
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

impl Ini {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_owned(), e))?;
        Self::parse(&path.to_string_lossy(), &text)
    }

    /// Parse INI text. `source` names the input in error messages.
    pub fn parse(source: &str, text: &str) -> Result<Self, ConfigError> {
        let mut ini = Ini::default();
        // Index of the current section, and the key that continuation lines extend
        let mut current: Option<usize> = None;
        let mut last_key: Option<String> = None;

        let error = |line: usize, message: &str| ConfigError::ParseError {
            source_name: source.to_owned(),
            line: line + 1,
            message: message.to_owned(),
        };

        for (n, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            let trimmed = line.trim();
            if trimmed.is_empty() {
                last_key = None;
                continue;
            }
            if trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if line.starts_with(char::is_whitespace) {
                if let (Some(section), Some(key)) = (current, &last_key) {
                    if let Some(value) = ini.sections[section].last_value_mut(key) {
                        value.push('\n');
                        value.push_str(trimmed);
                        continue;
                    }
                }
                return Err(error(n, "unexpected continuation line"));
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let Some(name) = header.strip_suffix(']') else {
                    return Err(error(n, "unterminated section header"));
                };
                let name = normalize_section(name);
                if name.is_empty() {
                    return Err(error(n, "empty section name"));
                }
                current = Some(ini.section_index_or_insert(name));
                last_key = None;
                continue;
            }

            let Some(split) = trimmed.find(['=', ':']) else {
                return Err(error(n, "expected 'key = value'"));
            };
            let key = normalize_key(&trimmed[..split]);
            if key.is_empty() {
                return Err(error(n, "empty option name"));
            }
            let Some(section) = current else {
                return Err(error(n, "option found before any section header"));
            };
            let value = unquote(trimmed[split + 1..].trim()).to_owned();
            ini.sections[section].push(key.clone(), value);
            last_key = Some(key);
        }

        Ok(ini)
    }

    fn section_index_or_insert(&mut self, name: String) -> usize {
        if let Some(index) = self.sections.iter().position(|s| s.name == name) {
            index
        } else {
            self.sections.push(IniSection::new(name));
            self.sections.len() - 1
        }
    }

    pub fn sections(&self) -> &[IniSection] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        let name = normalize_section(name);
        self.sections.iter().find(|s| s.name == name)
    }

    /// Looks up a key in a section, falling back to `DEFAULT`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.get_all(section, key)
            .and_then(|v| v.last())
            .map(|s| s.as_str())
    }

    /// All values for a key in a section, falling back to `DEFAULT`.
    pub fn get_all(&self, section: &str, key: &str) -> Option<&[String]> {
        self.section(section)
            .and_then(|s| s.values(key))
            .or_else(|| self.section(DEFAULT_SECTION).and_then(|s| s.values(key)))
    }

    /// Overlay another file on top of this one. Keys present in `other` replace ours.
    pub fn merge(&mut self, other: Ini) {
        for section in other.sections {
            let index = self.section_index_or_insert(section.name);
            let target = &mut self.sections[index];
            for (key, values) in section.entries {
                if let Some((_, existing)) = target.entries.iter_mut().find(|(k, _)| *k == key) {
                    *existing = values;
                } else {
                    target.entries.push((key, values));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[test]
    fn parse_sections_and_comments() -> Result<(), Box<dyn std::error::Error>> {
        let ini = Ini::parse(
            "test",
            r#"
# A comment
[DEFAULT]
verbose = true
; another comment
bind_port: 9000

[database]
connection = "sqlite://"
"#,
        )?;
        assert_eq!(ini.sections().len(), 2);
        assert_eq!(ini.get("DEFAULT", "verbose"), Some("true"));
        assert_eq!(ini.get("DEFAULT", "bind_port"), Some("9000"));
        assert_eq!(ini.get("database", "connection"), Some("sqlite://"));
        Ok(())
    }

    #[test]
    fn fallback_to_default() -> Result<(), Box<dyn std::error::Error>> {
        let ini = Ini::parse("test", "[default]\ndebug = 1\n[database]\n")?;
        assert_eq!(ini.get("database", "debug"), Some("1"));
        assert_eq!(ini.get("keystone_authtoken", "debug"), Some("1"));
        assert_eq!(ini.get("database", "missing"), None);
        Ok(())
    }

    #[test]
    fn keys_are_normalized() -> Result<(), Box<dyn std::error::Error>> {
        let ini = Ini::parse("test", "[database]\nMax-Pool-Size = 3\n")?;
        assert_eq!(ini.get("database", "max_pool_size"), Some("3"));
        assert_eq!(ini.get("database", "MAX-POOL-SIZE"), Some("3"));
        Ok(())
    }

    #[test]
    fn repeated_keys_accumulate() -> Result<(), Box<dyn std::error::Error>> {
        let ini = Ini::parse("test", "[DEFAULT]\nx = a\nx = b\n")?;
        assert_eq!(ini.get_all("DEFAULT", "x"), Some(&["a".to_owned(), "b".to_owned()][..]));
        assert_eq!(ini.get("DEFAULT", "x"), Some("b"));
        Ok(())
    }

    #[test]
    fn continuation_lines() -> Result<(), Box<dyn std::error::Error>> {
        let ini = Ini::parse("test", "[DEFAULT]\nx = first\n  second\n\tthird\ny = 2\n")?;
        assert_eq!(ini.get("DEFAULT", "x"), Some("first\nsecond\nthird"));
        assert_eq!(ini.get("DEFAULT", "y"), Some("2"));
        Ok(())
    }

    #[test]
    fn merge_overrides_per_key() -> Result<(), Box<dyn std::error::Error>> {
        let mut ini = Ini::parse("a", "[database]\nconnection = a\nmax_retries = 3\n")?;
        ini.merge(Ini::parse("b", "[database]\nconnection = b\n[DEFAULT]\ndebug = true\n")?);
        assert_eq!(ini.get("database", "connection"), Some("b"));
        assert_eq!(ini.get("database", "max_retries"), Some("3"));
        assert_eq!(ini.get("database", "debug"), Some("true"));
        Ok(())
    }

    #[rstest]
    #[case("x = 1\n", 1)]
    #[case("[DEFAULT\n", 1)]
    #[case("[]\n", 1)]
    #[case("[DEFAULT]\nnot an option\n", 2)]
    #[case("[DEFAULT]\n = value\n", 2)]
    #[case("  dangling\n", 1)]
    fn parse_errors(#[case] text: &str, #[case] line: usize) {
        match Ini::parse("broken.conf", text) {
            Err(ConfigError::ParseError {
                source_name,
                line: error_line,
                ..
            }) => {
                assert_eq!(source_name, "broken.conf");
                assert_eq!(error_line, line, "while parsing {:?}", text);
            }
            other => panic!("Expected parse error for {:?}, got {:?}", text, other),
        }
    }
}
