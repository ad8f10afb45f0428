//! Line-oriented section file format
//!
//! ```text
//! dir: local
//!         path /var/lib/vz
//!         content iso,vztmpl,backup
//!
//! zfspool: local-zfs
//!         pool rpool/data
//!         sparse
//! ```
//!
//! Each section starts with a `<type>: <id>` header followed by indented
//! `key value` lines. A bare key stands for `key 1`. Sections are separated by
//! blank lines, `#` starts a comment line.

use std::fmt::Write;

/// A section as read from the file, before any type checking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection {
    pub section_type: String,
    pub id: String,
    /// Properties in file order
    pub properties: Vec<(String, String)>,
    /// Line number of the header, starting at 1
    pub line: usize,
}

impl RawSection {
    pub fn new(section_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            section_type: section_type.into(),
            id: id.into(),
            properties: Vec::new(),
            line: 0,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Problem found while reading a section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionError {
    pub line: usize,
    /// Id of the affected section, if the header could be read
    pub section: Option<String>,
    pub message: String,
}

impl std::fmt::Display for SectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.section {
            Some(id) => write!(f, "line {} (section '{}'): {}", self.line, id, self.message),
            None => write!(f, "line {}: {}", self.line, self.message),
        }
    }
}

fn parse_header(line: &str) -> Option<(String, String)> {
    let (section_type, id) = line.split_once(':')?;
    let section_type = section_type.trim();
    let id = id.trim();
    if section_type.is_empty()
        || id.is_empty()
        || section_type.contains(char::is_whitespace)
        || id.contains(char::is_whitespace)
    {
        return None;
    }
    Some((section_type.to_string(), id.to_string()))
}

/// Split a section file into raw sections
///
/// Malformed sections are dropped and reported; the rest of the file is
/// still read.
pub fn parse_sections(text: &str) -> (Vec<RawSection>, Vec<SectionError>) {
    let mut sections = Vec::new();
    let mut errors = Vec::new();
    // current section and whether it is still valid
    let mut current: Option<(RawSection, bool)> = None;

    let finish = |current: &mut Option<(RawSection, bool)>, sections: &mut Vec<RawSection>| {
        if let Some((section, valid)) = current.take() {
            if valid {
                sections.push(section);
            }
        }
    };

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            finish(&mut current, &mut sections);
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }

        let indented = line.starts_with(char::is_whitespace);

        if !indented {
            finish(&mut current, &mut sections);
            match parse_header(trimmed) {
                Some((section_type, id)) => {
                    let mut section = RawSection::new(section_type, id);
                    section.line = lineno;
                    current = Some((section, true));
                }
                None => errors.push(SectionError {
                    line: lineno,
                    section: None,
                    message: format!("unable to parse section header '{}'", trimmed),
                }),
            }
            continue;
        }

        let Some((section, valid)) = current.as_mut() else {
            errors.push(SectionError {
                line: lineno,
                section: None,
                message: "property line outside of a section".to_string(),
            });
            continue;
        };

        let (key, value) = match trimmed.split_once(char::is_whitespace) {
            Some((k, v)) => (k.to_string(), v.trim().to_string()),
            None => (trimmed.to_string(), "1".to_string()),
        };

        if section.get(&key).is_some() {
            errors.push(SectionError {
                line: lineno,
                section: Some(section.id.clone()),
                message: format!("duplicate property '{}'", key),
            });
            *valid = false;
            continue;
        }

        section.properties.push((key, value));
    }
    finish(&mut current, &mut sections);

    (sections, errors)
}

/// Serialize sections back into the file format
pub fn write_sections(sections: &[RawSection]) -> String {
    let mut out = String::new();
    for (i, section) in sections.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "{}: {}", section.section_type, section.id);
        for (key, value) in &section.properties {
            let _ = writeln!(out, "\t{} {}", key, value);
        }
    }
    out
}
