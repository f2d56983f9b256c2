//! # URL Resolution Module
//!
//! Turns a [`CandidateRequest`] into zero or more download URLs. Two resolvers
//! exist: [`TemplateResolver`] expands the dataset's `url_template`, and
//! [`crate::search::SearchResolver`] asks a remote catalogue service.
//!
//! ## Template Syntax
//!
//! Templates use `{name}` fields, with `{{` and `}}` standing for literal
//! braces. Recognised fields are `experiment`, `ensemble_member`, `mip_table`,
//! `variable`, `grid`, `version`, `time_period` and `model`.
//!
//! ```rust
//! use ncmirror::resolve::template_placeholders;
//!
//! let fields = template_placeholders("http://h/{model}/{variable}_{grid}.nc")?;
//! assert_eq!(fields.len(), 3);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::catalog::{CandidateRequest, Dimension, TEMPLATE_ORDER};
use crate::config::DatasetSpec;
use crate::error::{Classify, ErrorKind};
use crate::search::SearchError;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unknown template placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("Malformed template: {0}")]
    Malformed(String),

    #[error("Template placeholder '{{{placeholder}}}' has no value for {candidate}")]
    MissingValue {
        placeholder: Placeholder,
        candidate: String,
    },

    #[error(transparent)]
    Search(#[from] SearchError),
}

impl Classify for ResolveError {
    fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Search(e) => e.kind(),
            _ => ErrorKind::Configuration,
        }
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// A recognised template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Experiment,
    EnsembleMember,
    MipTable,
    Variable,
    Grid,
    Version,
    TimePeriod,
    Model,
}

impl Placeholder {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "experiment" => Placeholder::Experiment,
            "ensemble_member" => Placeholder::EnsembleMember,
            "mip_table" => Placeholder::MipTable,
            "variable" => Placeholder::Variable,
            "grid" => Placeholder::Grid,
            "version" => Placeholder::Version,
            "time_period" => Placeholder::TimePeriod,
            "model" => Placeholder::Model,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Placeholder::Experiment => "experiment",
            Placeholder::EnsembleMember => "ensemble_member",
            Placeholder::MipTable => "mip_table",
            Placeholder::Variable => "variable",
            Placeholder::Grid => "grid",
            Placeholder::Version => "version",
            Placeholder::TimePeriod => "time_period",
            Placeholder::Model => "model",
        }
    }

    fn value_in<'a>(self, candidate: &'a CandidateRequest) -> Option<&'a str> {
        match self {
            Placeholder::Experiment => Some(&candidate.experiment),
            Placeholder::EnsembleMember => candidate.member.as_deref(),
            Placeholder::MipTable => candidate.mip_table.as_deref(),
            Placeholder::Variable => Some(&candidate.variable),
            Placeholder::Grid => candidate.grid.as_deref(),
            Placeholder::Version => candidate.version.as_deref(),
            Placeholder::TimePeriod => candidate.time_period.as_ref().map(|p| p.period_string()),
            Placeholder::Model => Some(&candidate.model),
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(Placeholder),
}

fn parse_template(template: &str) -> ResolveResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(ResolveError::Malformed(format!(
                                "unterminated placeholder '{{{name}' in '{template}'"
                            )));
                        }
                    }
                }
                let field = Placeholder::from_name(name.trim())
                    .ok_or_else(|| ResolveError::UnknownPlaceholder(name.clone()))?;
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(field));
            }
            '}' => {
                return Err(ResolveError::Malformed(format!(
                    "single '}}' encountered in '{template}'"
                )));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Lists the fields a template references, in order of appearance.
pub fn template_placeholders(template: &str) -> ResolveResult<Vec<Placeholder>> {
    Ok(parse_template(template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Field(p) => Some(p),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Substitutes every field of `template` from `candidate`.
pub fn expand_template(template: &str, candidate: &CandidateRequest) -> ResolveResult<String> {
    let mut url = String::with_capacity(template.len() + 32);
    for segment in parse_template(template)? {
        match segment {
            Segment::Literal(text) => url.push_str(&text),
            Segment::Field(placeholder) => {
                let value = placeholder
                    .value_in(candidate)
                    .ok_or_else(|| ResolveError::MissingValue {
                        placeholder,
                        candidate: candidate.to_string(),
                    })?;
                url.push_str(value);
            }
        }
    }
    Ok(url)
}

/// Final path segment of a URL, without query or fragment.
pub fn url_filename(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

/// Maps a candidate to the URLs that should be fetched for it.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    /// Dimensions this resolver needs enumerated.
    fn order(&self) -> &'static [Dimension];

    async fn resolve(&self, candidate: &CandidateRequest, dataset: &DatasetSpec) -> ResolveResult<Vec<String>>;
}

/// Resolves by expanding `url_template`; always yields exactly one URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateResolver;

#[async_trait]
impl UrlResolver for TemplateResolver {
    fn order(&self) -> &'static [Dimension] {
        TEMPLATE_ORDER
    }

    async fn resolve(&self, candidate: &CandidateRequest, dataset: &DatasetSpec) -> ResolveResult<Vec<String>> {
        Ok(vec![expand_template(&dataset.url_template, candidate)?])
    }
}
