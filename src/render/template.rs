//! Text templates with `${name}` placeholders.
//!
//! Placeholders name outputs. `$${` writes a literal `${`, which keeps shell
//! and ssh syntax usable inside templates.

use std::collections::BTreeMap;

use crate::error::RenderError;
use crate::graph::expr::{Segment, parse_segments};

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses template source.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::TemplateSyntax` for an unclosed or empty
    /// placeholder, or one that is not a plain name.
    pub fn parse(name: &str, source: &str) -> Result<Self, RenderError> {
        let segments = parse_segments(source).map_err(|message| RenderError::TemplateSyntax {
            template: name.to_string(),
            message,
        })?;

        for segment in &segments {
            if let Segment::Expr(body) = segment
                && !is_placeholder_name(body)
            {
                return Err(RenderError::TemplateSyntax {
                    template: name.to_string(),
                    message: format!("'${{{body}}}' is not an output name"),
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    /// Returns the template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the distinct placeholders in order of first use.
    #[must_use]
    pub fn placeholders(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Expr(body) = segment
                && !seen.contains(&body.as_str())
            {
                seen.push(body);
            }
        }
        seen
    }

    /// Substitutes placeholder values.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::UndefinedPlaceholder` for a placeholder with no
    /// value.
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<String, RenderError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(placeholder) => {
                    let value = values.get(placeholder).ok_or_else(|| {
                        RenderError::UndefinedPlaceholder {
                            template: self.name.clone(),
                            placeholder: placeholder.clone(),
                        }
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn is_placeholder_name(body: &str) -> bool {
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
