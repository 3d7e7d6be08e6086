//! Configuration validation and report formatting.

use std::collections::HashMap;

use super::model::AppConfig;
use crate::retry_dlq::FailureDomain;

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Blocks configuration loading.
    Error,
    /// Logged but allows loading.
    Warning,
}

/// A validation issue found during configuration checking.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: ValidationSeverity,
    /// Path to the problematic config field (e.g., "domains.orders.attempts").
    pub path: String,
    /// Description of the issue.
    pub message: String,
    /// Optional suggestion for fixing the issue.
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Creates a new error-level validation issue.
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Error,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Creates a new warning-level validation issue.
    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Warning,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Adds a suggestion to this validation issue.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Result of validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Adds an issue to the result.
    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Returns true if there are no errors (warnings are allowed).
    pub fn is_valid(&self) -> bool {
        self.error_count() == 0
    }

    /// Returns an iterator over error-level issues.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Error)
    }

    /// Returns an iterator over warning-level issues.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Warning)
    }

    /// Returns the number of errors.
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

/// Validates semantic correctness of configuration values.
pub fn validate_config(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let settings = &config.job_service;

    if settings.num_workers == 0 {
        result.add(
            ValidationIssue::error("job_service.num_workers", "At least one worker is required")
                .with_suggestion("Set num_workers to 1 or more"),
        );
    }
    if settings.lock_duration_ms == 0 {
        result.add(ValidationIssue::error(
            "job_service.lock_duration_ms",
            "Lock duration must be greater than zero",
        ));
    }
    if settings.poll_interval_ms == 0 {
        result.add(
            ValidationIssue::warning(
                "job_service.poll_interval_ms",
                "A zero poll interval makes idle workers spin",
            )
            .with_suggestion("Use a poll interval of at least 50ms"),
        );
    }
    if settings.stalled_interval_ms < settings.lock_duration_ms {
        result.add(ValidationIssue::warning(
            "job_service.stalled_interval_ms",
            "Stalled checks run more often than leases expire",
        ));
    }

    if config.domains.is_empty() {
        result.add(ValidationIssue::warning("domains", "No retry domains configured"));
    }

    // Two domains resolving to one queue would share a worker pool.
    let mut seen: HashMap<String, &str> = HashMap::new();
    for (name, domain) in &config.domains {
        let prefix = format!("domains.{}", name);

        if domain.attempts == 0 {
            result.add(
                ValidationIssue::error(format!("{}.attempts", prefix), "Attempts must be at least 1")
                    .with_suggestion("Use attempts: 1 to disable retries"),
            );
        }

        let blank = match &domain.identifier {
            FailureDomain::Consumer {
                topic,
                consumer_group,
            } => topic.trim().is_empty() || consumer_group.trim().is_empty(),
            FailureDomain::Producer { producer } => producer.trim().is_empty(),
        };
        if blank {
            result.add(ValidationIssue::error(
                format!("{}.identifier", prefix),
                "Identifier fields must not be empty",
            ));
        }

        let queue = domain.identifier.queue_name();
        if let Some(other) = seen.insert(queue.clone(), name) {
            result.add(ValidationIssue::error(
                format!("{}.identifier", prefix),
                format!("Resolves to queue '{}' already used by domain '{}'", queue, other),
            ));
        }
    }

    result
}

/// Formats a validation result into a human-readable report.
pub fn format_report(result: &ValidationResult) -> String {
    let errors: Vec<_> = result.errors().collect();
    let warnings: Vec<_> = result.warnings().collect();

    if errors.is_empty() && warnings.is_empty() {
        return "Configuration is valid.".to_string();
    }

    let mut report = String::new();

    if !errors.is_empty() {
        report.push_str("\nConfig Validation Failed\n");
        report.push_str("========================\n\n");
    }

    for issue in &errors {
        report.push_str(&format_issue(issue));
        report.push('\n');
    }

    if !warnings.is_empty() {
        if !errors.is_empty() {
            report.push_str("\nWarnings:\n");
            report.push_str("---------\n\n");
        }
        for issue in &warnings {
            report.push_str(&format_issue(issue));
            report.push('\n');
        }
    }

    report.push_str("---\n");
    report.push_str(&format!(
        "{} warning(s), {} error(s)\n",
        warnings.len(),
        errors.len()
    ));

    if !errors.is_empty() {
        report.push_str("Config rejected.\n");
    }

    report
}

/// Formats a single validation issue.
fn format_issue(issue: &ValidationIssue) -> String {
    let prefix = match issue.severity {
        ValidationSeverity::Error => "ERROR",
        ValidationSeverity::Warning => "WARNING",
    };

    let mut output = format!("{} {}\n", prefix, issue.path);
    output.push_str(&format!("  └─ {}\n", issue.message));

    if let Some(suggestion) = &issue.suggestion {
        output.push_str(&format!("     {}\n", suggestion));
    }

    output
}
