//! Ordered diagnostic records accumulated during an operation.
//!
//! This is the only error-reporting surface the facade exposes: callers run an
//! operation, then walk the records and print `code: message` pairs.

use std::{error::Error as _, fmt};

use crate::error::CaptureError;

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Severity {
    Info,
    Error,
    Data,
}

/// One `(code, message, details, severity)` record.
///
/// # Example
/// ```rust
/// use strobe_core::prelude::{Diagnostic, Severity};
///
/// let msg = Diagnostic::new("V004", "failed to open /dev/video9", Severity::Error);
/// assert!(msg.is_error());
/// assert_eq!(msg.to_string(), "V004: failed to open /dev/video9");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostic {
    code: String,
    message: String,
    details: Option<String>,
    severity: Severity,
}

impl Diagnostic {
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            severity,
        }
    }

    /// Attach free-form detail text.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&CaptureError> for Diagnostic {
    fn from(err: &CaptureError) -> Self {
        let diag = Diagnostic::new(err.code(), err.to_string(), Severity::Error);
        // Keep the innermost cause around; the message already embeds the first level.
        let mut cause = err.source();
        let mut innermost = None;
        while let Some(inner) = cause {
            innermost = Some(inner.to_string());
            cause = inner.source();
        }
        match innermost {
            Some(text) => diag.with_details(text),
            None => diag,
        }
    }
}

/// Ordered list of diagnostic records.
///
/// # Example
/// ```rust
/// use strobe_core::prelude::{CaptureError, Diagnostics};
///
/// let mut diags = Diagnostics::new();
/// diags.info("V012", "3 frames captured");
/// diags.record(&CaptureError::NotOpen);
/// assert!(diags.has_errors());
/// assert_eq!(diags.errors().count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostics {
    messages: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.messages.push(diag);
    }

    pub fn info(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.push(Diagnostic::new(code, message, Severity::Info));
    }

    pub fn error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.push(Diagnostic::new(code, message, Severity::Error));
    }

    pub fn data(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) {
        self.push(Diagnostic::new(code, message, Severity::Data).with_details(details));
    }

    /// Append an error record derived from `err`.
    pub fn record(&mut self, err: &CaptureError) {
        self.push(Diagnostic::from(err));
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter().filter(|m| m.is_error())
    }

    /// Whether any record carries `code`.
    pub fn contains_code(&self, code: &str) -> bool {
        self.messages.iter().any(|m| m.code == code)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.messages
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Extend<Diagnostic> for Diagnostics {
    fn extend<T: IntoIterator<Item = Diagnostic>>(&mut self, iter: T) {
        self.messages.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::ControlError;

    #[test]
    fn records_keep_insertion_order() {
        let mut diags = Diagnostics::new();
        diags.info("V012", "first");
        diags.error("V006", "second");
        diags.data("V012", "third", "raw");
        let codes: Vec<_> = diags.iter().map(|d| d.message().to_string()).collect();
        assert_eq!(codes, ["first", "second", "third"]);
        assert_eq!(diags.iter().last().and_then(|d| d.details()), Some("raw"));
    }

    #[test]
    fn capture_error_carries_innermost_cause() {
        let err = CaptureError::NotACaptureNode {
            path: PathBuf::from("/dev/null"),
            source: ControlError::new("VIDIOC_QUERYCAP", libc::ENOTTY),
        };
        let diag = Diagnostic::from(&err);
        assert_eq!(diag.code(), "V005");
        assert_eq!(diag.message(), "/dev/null: not a v4l2 node");
        assert!(diag.details().unwrap().starts_with("VIDIOC_QUERYCAP: failed"));
    }

    #[test]
    fn info_only_channel_has_no_errors() {
        let mut diags = Diagnostics::new();
        diags.info("V012", "done");
        assert!(!diags.has_errors());
        assert!(diags.contains_code("V012"));
        assert!(!diags.contains_code("V005"));
    }
}
