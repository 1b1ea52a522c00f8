//! Research request payloads and their validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, QueueError, Result};

/// Default upper bound on stored query length, in characters.
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 1000;

pub const MIN_SOURCE_LIMIT: u32 = 1;
pub const MAX_SOURCE_LIMIT: u32 = 50;
pub const DEFAULT_SOURCE_LIMIT: u32 = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
    Json,
    Html,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Html => "html",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "html" => Ok(Self::Html),
            other => Err(QueueError::invalid_field(
                ErrorCode::InvalidFormat,
                "output_format",
                format!(
                    "Unsupported output format '{}', expected text, markdown, json or html",
                    other
                ),
            )),
        }
    }
}

/// Research focus handed to the research backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    #[default]
    General,
    Academic,
    News,
    Technical,
    Business,
    Science,
}

impl FocusArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Academic => "academic",
            Self::News => "news",
            Self::Technical => "technical",
            Self::Business => "business",
            Self::Science => "science",
        }
    }
}

impl fmt::Display for FocusArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FocusArea {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(Self::General),
            "academic" => Ok(Self::Academic),
            "news" => Ok(Self::News),
            "technical" => Ok(Self::Technical),
            "business" => Ok(Self::Business),
            "science" => Ok(Self::Science),
            other => Err(QueueError::invalid_field(
                ErrorCode::InvalidFormat,
                "focus_area",
                format!("Unsupported focus area '{}'", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// A validated request, as stored on the job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPayload {
    pub query: String,
    pub output_format: OutputFormat,
    pub source_limit: u32,
    pub focus_area: FocusArea,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A request as supplied by a producer, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default, alias = "max_sources")]
    pub source_limit: Option<i64>,
    #[serde(default)]
    pub focus_area: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn with_source_limit(mut self, limit: i64) -> Self {
        self.source_limit = Some(limit);
        self
    }

    pub fn with_focus_area(mut self, focus: impl Into<String>) -> Self {
        self.focus_area = Some(focus.into());
        self
    }

    /// Validate and normalize into a storable payload.
    ///
    /// Oversized queries are truncated, not rejected. Unknown formats or focus
    /// areas, blank queries and out-of-range source limits are rejected.
    pub fn validate(&self, max_query_length: usize) -> Result<ResearchPayload> {
        if self.query.trim().is_empty() {
            return Err(QueueError::invalid_field(
                ErrorCode::MissingRequiredField,
                "query",
                "Query must not be empty",
            ));
        }

        let output_format = match self.output_format.as_deref() {
            Some(raw) => raw.parse()?,
            None => OutputFormat::default(),
        };
        let focus_area = match self.focus_area.as_deref() {
            Some(raw) => raw.parse()?,
            None => FocusArea::default(),
        };

        let source_limit = match self.source_limit {
            None => DEFAULT_SOURCE_LIMIT,
            Some(n) if (MIN_SOURCE_LIMIT as i64..=MAX_SOURCE_LIMIT as i64).contains(&n) => n as u32,
            Some(n) => {
                return Err(QueueError::invalid_field(
                    ErrorCode::InvalidInput,
                    "source_limit",
                    format!(
                        "Source limit {} out of range {}..={}",
                        n, MIN_SOURCE_LIMIT, MAX_SOURCE_LIMIT
                    ),
                ))
            }
        };

        Ok(ResearchPayload {
            query: truncate_query(&self.query, max_query_length),
            output_format,
            source_limit,
            focus_area,
            metadata: Map::new(),
        })
    }
}

/// Cut `query` to at most `max_chars` characters without splitting a
/// character. Applying it twice gives the same result as once.
pub fn truncate_query(query: &str, max_chars: usize) -> String {
    match query.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => query[..byte_idx].to_string(),
        None => query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_to_exact_bound() {
        let long = "a".repeat(1500);
        let once = truncate_query(&long, DEFAULT_MAX_QUERY_LENGTH);
        assert_eq!(once.chars().count(), 1000);

        let twice = truncate_query(&once, DEFAULT_MAX_QUERY_LENGTH);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_truncation_keeps_multibyte_chars_whole() {
        let query = "é".repeat(5);
        let cut = truncate_query(&query, 3);
        assert_eq!(cut, "ééé");
        assert_eq!(truncate_query("short", 1000), "short");
    }

    #[test]
    fn test_validate_defaults() {
        let payload = ResearchRequest::new("quantum computing trends").validate(1000).unwrap();
        assert_eq!(payload.output_format, OutputFormat::Text);
        assert_eq!(payload.focus_area, FocusArea::General);
        assert_eq!(payload.source_limit, DEFAULT_SOURCE_LIMIT);
    }

    #[test]
    fn test_validate_parses_case_insensitively() {
        let payload = ResearchRequest::new("q")
            .with_output_format("JSON")
            .with_focus_area(" Academic ")
            .with_source_limit(50)
            .validate(1000)
            .unwrap();
        assert_eq!(payload.output_format, OutputFormat::Json);
        assert_eq!(payload.focus_area, FocusArea::Academic);
        assert_eq!(payload.source_limit, 50);
    }

    #[test]
    fn test_validate_rejects_malformed_fields() {
        let err = ResearchRequest::new("q").with_output_format("pdf").validate(1000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFormat);

        let err = ResearchRequest::new("q").with_focus_area("astrology").validate(1000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFormat);

        let err = ResearchRequest::new("q").with_source_limit(0).validate(1000).unwrap_err();
        assert!(err.is_validation());

        let err = ResearchRequest::new("q").with_source_limit(51).validate(1000).unwrap_err();
        assert!(err.is_validation());

        let err = ResearchRequest::new("   ").validate(1000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingRequiredField);
    }

    #[test]
    fn test_validate_truncates_instead_of_rejecting() {
        let payload = ResearchRequest::new("x".repeat(1500)).validate(1000).unwrap();
        assert_eq!(payload.query.len(), 1000);
    }

    #[test]
    fn test_request_accepts_max_sources_alias() {
        let request: ResearchRequest =
            serde_json::from_str(r#"{"query":"q","max_sources":5}"#).unwrap();
        assert_eq!(request.source_limit, Some(5));
    }
}
