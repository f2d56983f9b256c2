//! # Error Taxonomy
//!
//! Every component returns its own `thiserror` enum. Each of those maps onto one
//! [`ErrorKind`], which is what the orchestrator looks at when deciding whether an
//! enumeration may continue. Only [`ErrorKind::Configuration`] is fatal to a run.

use std::fmt;

/// Coarse classification shared by all component errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or inconsistent configuration. Aborts the run before any I/O.
    Configuration,
    /// Timeout, connection failure or non-success HTTP status.
    Transport,
    /// Unreadable file or missing coordinate / variable names.
    Format,
    /// Raw and processed statistics disagree (validation only).
    Consistency,
    /// Malformed search-API entry or response document.
    Parse,
}

impl ErrorKind {
    /// Whether an error of this kind stops the whole run.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Configuration)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::Format => "format",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Parse => "parse",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every component error so callers can branch on the kind
/// without matching on concrete variants.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
