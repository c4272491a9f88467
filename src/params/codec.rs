//! Text form of a registry (`.match` files)
//!
//! ```text
//! # IMAGE MATCH DATA
//! [find]
//! backend = template
//! similarity = <value='0.8' min='0.0' max='1.0' delta='0.1' tolerance='0.01' fixed='true'>
//! ```

use crate::error::{FinderError, FinderResult};

use super::parameter::Parameter;
use super::registry::ParamRegistry;

pub const HEADER: &str = "# IMAGE MATCH DATA";

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub raw: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    pub line: usize,
    pub entries: Vec<Entry>,
}

impl Section {
    pub fn backend(&self) -> Option<&Entry> {
        self.entries.iter().find(|e| e.key == "backend")
    }
}

pub fn serialize(registry: &ParamRegistry) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    for (name, category) in registry.categories() {
        out.push_str(&format!("[{}]\n", name));
        out.push_str(&format!("backend = {}\n", category.backend()));
        for (param, value) in category.params() {
            out.push_str(&format!("{} = {}\n", param, value));
        }
        out.push('\n');
    }
    out
}

/// Split text into sections without interpreting parameter values.
pub fn parse_sections(text: &str) -> FinderResult<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            if name.is_empty() {
                return Err(FinderError::malformed(line_no, "empty section name"));
            }
            if sections.iter().any(|s| s.name == name) {
                return Err(FinderError::malformed(line_no, format!("duplicate section [{}]", name)));
            }
            sections.push(Section {
                name: name.to_string(),
                line: line_no,
                entries: Vec::new(),
            });
            continue;
        }
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| FinderError::malformed(line_no, format!("expected 'name = value', got '{}'", line)))?;
        let section = sections
            .last_mut()
            .ok_or_else(|| FinderError::malformed(line_no, "entry outside of any section"))?;
        section.entries.push(Entry {
            key: key.trim().to_string(),
            raw: raw.trim().to_string(),
            line: line_no,
        });
    }
    Ok(sections)
}

/// Apply parsed sections onto a registry built with the matching schema.
pub fn apply_sections(registry: &mut ParamRegistry, sections: &[Section]) -> FinderResult<()> {
    for section in sections {
        if !registry.has_category(&section.name) {
            return Err(FinderError::malformed(
                section.line,
                format!("unknown category [{}]", section.name),
            ));
        }
        if let Some(entry) = section.backend() {
            if registry.backend(&section.name)? != entry.raw {
                registry
                    .select_backend(&section.name, &entry.raw, false)
                    .map_err(|e| FinderError::malformed(entry.line, e.to_string()))?;
            }
        }
        for entry in section.entries.iter().filter(|e| e.key != "backend") {
            let declared = registry.get(&section.name, &entry.key).map_err(|_| {
                FinderError::malformed(
                    entry.line,
                    format!("unknown parameter '{}' in [{}]", entry.key, section.name),
                )
            })?;
            let parsed = Parameter::parse(&entry.raw, declared)
                .map_err(|reason| FinderError::malformed(entry.line, format!("{}: {}", entry.key, reason)))?;
            registry.replace(&section.name, &entry.key, parsed)?;
        }
    }
    Ok(())
}

/// Family named by the `[find]` section's backend, if any.
pub fn find_backend(sections: &[Section]) -> Option<&Entry> {
    sections.iter().find(|s| s.name == "find").and_then(|s| s.backend())
}
