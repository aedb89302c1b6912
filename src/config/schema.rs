use crate::annotate::AnnotationStrategy;
use crate::head::HeadStrategy;
use serde::Deserialize;
use std::fmt;

/// Longest x86 instruction; the trace scan never looks further back.
pub const MAX_TRACE_SCAN: usize = 15;

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub annotation: AnnotationSettings,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub import: ImportSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        let limit = self.resolver.trace_scan_limit;
        if limit == 0 || limit > MAX_TRACE_SCAN {
            issues.push(ValidationIssue::OutOfRange {
                field: "resolver.trace_scan_limit",
                value: limit as u64,
                min: 1,
                max: MAX_TRACE_SCAN as u64,
            });
        }
        check_order(&self.resolver.order, "resolver.order", &mut issues);

        if self.annotation.string_preview_limit < 4 {
            issues.push(ValidationIssue::OutOfRange {
                field: "annotation.string_preview_limit",
                value: self.annotation.string_preview_limit as u64,
                min: 4,
                max: u32::MAX as u64,
            });
        }
        check_order(&self.annotation.order, "annotation.order", &mut issues);

        let width = self.export.address_width;
        if width == 0 || width > 16 {
            issues.push(ValidationIssue::OutOfRange {
                field: "export.address_width",
                value: width as u64,
                min: 1,
                max: 16,
            });
        }

        if self.import.extensions.iter().any(|ext| ext.trim().is_empty()) {
            issues.push(ValidationIssue::InvalidValue {
                field: "import.extensions",
                message: "extensions must not be empty strings".to_string(),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

fn check_order<T: PartialEq + fmt::Debug>(
    order: &[T],
    field: &'static str,
    issues: &mut Vec<ValidationIssue>,
) {
    if order.is_empty() {
        issues.push(ValidationIssue::EmptyStrategyList { field });
    }
    for (idx, strategy) in order.iter().enumerate() {
        if order[..idx].contains(strategy) {
            issues.push(ValidationIssue::InvalidValue {
                field,
                message: format!("strategy {strategy:?} listed more than once"),
            });
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    #[serde(default = "default_trace_scan_limit")]
    pub trace_scan_limit: usize,
    #[serde(default = "HeadStrategy::default_order")]
    pub order: Vec<HeadStrategy>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            trace_scan_limit: default_trace_scan_limit(),
            order: HeadStrategy::default_order(),
        }
    }
}

fn default_trace_scan_limit() -> usize {
    MAX_TRACE_SCAN
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AnnotationSettings {
    /// Operand values below this are treated as plain numbers.
    #[serde(default = "default_min_operand_address")]
    pub min_operand_address: u64,
    #[serde(default = "default_string_preview_limit")]
    pub string_preview_limit: usize,
    #[serde(default = "AnnotationStrategy::default_order")]
    pub order: Vec<AnnotationStrategy>,
}

impl Default for AnnotationSettings {
    fn default() -> Self {
        Self {
            min_operand_address: default_min_operand_address(),
            string_preview_limit: default_string_preview_limit(),
            order: AnnotationStrategy::default_order(),
        }
    }
}

fn default_min_operand_address() -> u64 {
    0x1000
}

fn default_string_preview_limit() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    #[serde(default = "default_address_width")]
    pub address_width: usize,
    /// Header lines, each written as a `# ` comment.
    #[serde(default = "default_header")]
    pub header: Vec<String>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            address_width: default_address_width(),
            header: default_header(),
        }
    }
}

fn default_address_width() -> usize {
    16
}

fn default_header() -> Vec<String> {
    vec![
        "Patch export (filtered view)".to_string(),
        "Format: Address:OldByte->NewByte".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    /// File extensions picked up when importing a whole directory.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec!["txt".to_string(), "patch".to_string(), "1337".to_string()]
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    EmptyStrategyList {
        field: &'static str,
    },
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyStrategyList { field } => {
                write!(f, "'{field}' must list at least one strategy")
            }
            ValidationIssue::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "'{field}' is {value}, expected {min}..={max}"),
            ValidationIssue::InvalidValue { field, message } => {
                write!(f, "invalid '{field}': {message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.resolver.trace_scan_limit, 15);
        assert_eq!(settings.annotation.min_operand_address, 0x1000);
        assert_eq!(settings.annotation.string_preview_limit, 60);
        assert_eq!(settings.export.address_width, 16);
    }

    #[test]
    fn test_collects_every_issue() {
        let mut settings = Settings::default();
        settings.resolver.trace_scan_limit = 0;
        settings.resolver.order.clear();
        settings.export.address_width = 17;

        let err = settings.validate().unwrap_err();
        assert_eq!(err.issues.len(), 3);
        let text = err.to_string();
        assert!(text.contains("resolver.trace_scan_limit"));
        assert!(text.contains("resolver.order"));
        assert!(text.contains("export.address_width"));
    }

    #[test]
    fn test_duplicate_strategy_rejected() {
        let mut settings = Settings::default();
        settings.annotation.order = vec![
            AnnotationStrategy::CommentAtHead,
            AnnotationStrategy::CommentAtHead,
        ];
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err.issues[0],
            ValidationIssue::InvalidValue {
                field: "annotation.order",
                ..
            }
        ));
    }
}
