#![forbid(unsafe_code)]

//! Two-level SQL templates.
//!
//! A model template uses `{name}` for placeholders (values known when the
//! node is built) and `{{name}}` for references (other nodes, resolved only
//! when the graph is compiled). Literal braces need escaping for both
//! levels, so a literal `{` is written `{{{{` (see [`escape_format_string`]
//! with `times = 2`).
//!
//! The template is parsed once into [`Segment`]s. Placeholder values are
//! spliced in as segments and never re-scanned, so values containing braces
//! cannot corrupt the template they are inserted into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("single '{brace}' encountered at position {position}")]
    SingleBrace { brace: char, position: usize },
    #[error("invalid field name {field:?} at position {position}")]
    InvalidField { field: String, position: usize },
    #[error("no value provided for field {0:?}")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Text(String),
    Placeholder(String),
    Reference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Placeholder,
    Reference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse template source text: `{name}` is a placeholder, `{{name}}` is a
    /// reference, and every other brace must be escaped for two rounds.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut template = Self::new();
        for piece in scan_format(source)? {
            match piece {
                Piece::Field(name) => template.push_placeholder(name),
                Piece::Text(text) => {
                    for inner in scan_format(&text)? {
                        match inner {
                            Piece::Field(name) => template.push_reference(name),
                            Piece::Text(literal) => template.push_text(&literal),
                        }
                    }
                }
            }
        }
        Ok(template)
    }

    #[must_use]
    pub fn literal(text: &str) -> Self {
        let mut template = Self::new();
        template.push_text(text);
        template
    }

    #[must_use]
    pub fn reference(name: impl Into<String>) -> Self {
        let mut template = Self::new();
        template.push_reference(name);
        template
    }

    #[must_use]
    pub fn placeholder(name: impl Into<String>) -> Self {
        let mut template = Self::new();
        template.push_placeholder(name);
        template
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Text(text.to_owned()));
        }
    }

    pub fn push_placeholder(&mut self, name: impl Into<String>) {
        self.segments.push(Segment::Placeholder(name.into()));
    }

    pub fn push_reference(&mut self, name: impl Into<String>) {
        self.segments.push(Segment::Reference(name.into()));
    }

    pub fn append(&mut self, other: &Template) {
        for segment in &other.segments {
            match segment {
                Segment::Text(text) => self.push_text(text),
                other => self.segments.push(other.clone()),
            }
        }
    }

    #[must_use]
    pub fn placeholder_names(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn reference_names(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Reference(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Placeholder(_)))
    }

    /// Replace every placeholder with its value. Values are spliced in as
    /// segments; text inside them is never re-parsed.
    pub fn substitute_placeholders(
        &self,
        values: &BTreeMap<String, Template>,
    ) -> Result<Template, TemplateError> {
        let mut out = Template::new();
        for segment in &self.segments {
            match segment {
                Segment::Placeholder(name) => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingValue(name.clone()))?;
                    out.append(value);
                }
                Segment::Text(text) => out.push_text(text),
                Segment::Reference(name) => out.push_reference(name.clone()),
            }
        }
        Ok(out)
    }

    /// Render to a string, asking `field` for the text of every placeholder
    /// and reference.
    pub fn render<E>(
        &self,
        mut field: impl FnMut(FieldKind, &str) -> Result<String, E>,
    ) -> Result<String, E> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => out.push_str(&field(FieldKind::Placeholder, name)?),
                Segment::Reference(name) => out.push_str(&field(FieldKind::Reference, name)?),
            }
        }
        Ok(out)
    }

    /// Inverse of [`Template::parse`].
    #[must_use]
    pub fn to_template_string(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(&escape_format_string(text, 2)),
                Segment::Placeholder(name) => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
                Segment::Reference(name) => {
                    out.push_str("{{");
                    out.push_str(name);
                    out.push_str("}}");
                }
            }
        }
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_template_string())
    }
}

impl TryFrom<String> for Template {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Template> for String {
    fn from(value: Template) -> Self {
        value.to_template_string()
    }
}

// ── Format-string primitives ────────────────────────────────────────────

/// Double every brace in `value`, `times` times over, so that `times`
/// rounds of [`format_string`] give back `value` unchanged.
#[must_use]
pub fn escape_format_string(value: &str, times: usize) -> String {
    let mut out = value.to_owned();
    for _ in 0..times {
        out = out.replace('{', "{{").replace('}', "}}");
    }
    out
}

/// One round of format-string substitution: `{{` and `}}` become single
/// braces and `{name}` is replaced by `values[name]`.
pub fn format_string(source: &str, values: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    for piece in scan_format(source)? {
        match piece {
            Piece::Text(text) => out.push_str(&text),
            Piece::Field(name) => {
                let value = values
                    .get(&name)
                    .ok_or(TemplateError::MissingValue(name))?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

#[must_use]
pub fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Field(String),
}

fn scan_format(source: &str) -> Result<Vec<Piece>, TemplateError> {
    let chars: Vec<char> = source.chars().collect();
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                text.push('{');
                i += 2;
            }
            '{' => {
                let Some(close) = chars[i + 1..].iter().position(|c| *c == '}') else {
                    return Err(TemplateError::SingleBrace {
                        brace: '{',
                        position: i,
                    });
                };
                let field: String = chars[i + 1..i + 1 + close].iter().collect();
                if !is_valid_field_name(&field) {
                    return Err(TemplateError::InvalidField { field, position: i });
                }
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Field(field));
                i += close + 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                text.push('}');
                i += 2;
            }
            '}' => {
                return Err(TemplateError::SingleBrace {
                    brace: '}',
                    position: i,
                });
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}
