//! Failure classification.
//!
//! Decides whether a failed build is worth retrying by scanning its captured
//! output for markers of transient infrastructure trouble.

use shipit_config::ClassifierConfig;
use shipit_core::BuildOutcome;
use std::time::Duration;

/// Markers used when none are configured. Matched case-insensitively.
pub const DEFAULT_RETRYABLE_MARKERS: &[&str] = &[
    "network error",
    "timeout",
    "econnreset",
    "eai_again",
    "temporarily unavailable",
    "fetch failed",
    "npm err! code eai_again",
    "npm err! network",
];

/// What happened to the build output after the build command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactResult {
    /// Every output file was stored; `size` is the total in bytes.
    Uploaded { size: i64 },
    /// Locating or storing the output failed.
    Failed(String),
    /// The build command did not succeed, so nothing was uploaded.
    NotAttempted,
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    markers: Vec<String>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_MARKERS.iter().copied())
    }
}

impl FailureClassifier {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.into().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        match &config.markers {
            Some(markers) => Self::new(markers.iter().cloned()),
            None => Self::default(),
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Whether `text` contains any retryable marker.
    pub fn is_retryable(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.markers.iter().any(|marker| text.contains(marker.as_str()))
    }

    /// A failure with `reason`, retryable if `text` carries a marker.
    pub fn failure(&self, text: &str, reason: impl Into<String>) -> BuildOutcome {
        let reason = reason.into();
        if self.is_retryable(text) {
            BuildOutcome::RetryableFailure { reason }
        } else {
            BuildOutcome::PermanentFailure { reason }
        }
    }

    /// Outcome of a finished build.
    ///
    /// `exit_code` is `None` when the process was killed by a signal.
    pub fn classify(
        &self,
        exit_code: Option<i32>,
        transcript: &str,
        artifacts: &ArtifactResult,
        elapsed: Duration,
    ) -> BuildOutcome {
        match (exit_code, artifacts) {
            (Some(0), ArtifactResult::Uploaded { size }) => BuildOutcome::Success {
                size: *size,
                duration_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            },
            (Some(0), ArtifactResult::Failed(message)) => {
                self.failure(&format!("{}\n{}", transcript, message), message.clone())
            }
            (Some(0), ArtifactResult::NotAttempted) => {
                self.failure(transcript, "Build output was not uploaded")
            }
            (Some(code), _) => {
                self.failure(transcript, format!("Build failed with exit code {}", code))
            }
            (None, _) => self.failure(transcript, "Build process was terminated by a signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_success_requires_uploaded_artifacts() {
        let classifier = FailureClassifier::default();
        assert_eq!(
            classifier.classify(Some(0), "", &ArtifactResult::Uploaded { size: 42 }, SECOND),
            BuildOutcome::Success {
                size: 42,
                duration_ms: 1000
            }
        );
        assert!(matches!(
            classifier.classify(Some(0), "", &ArtifactResult::NotAttempted, SECOND),
            BuildOutcome::PermanentFailure { .. }
        ));
    }

    #[test]
    fn test_nonzero_exit_with_marker_is_retryable() {
        let classifier = FailureClassifier::default();
        let outcome = classifier.classify(
            Some(1),
            "npm ERR! code ECONNRESET\nnpm ERR! network aborted",
            &ArtifactResult::NotAttempted,
            SECOND,
        );
        assert_eq!(
            outcome,
            BuildOutcome::RetryableFailure {
                reason: "Build failed with exit code 1".into()
            }
        );
    }

    #[test]
    fn test_nonzero_exit_without_marker_is_permanent() {
        let classifier = FailureClassifier::default();
        let outcome = classifier.classify(
            Some(2),
            "SyntaxError: Unexpected token",
            &ArtifactResult::NotAttempted,
            SECOND,
        );
        assert_eq!(
            outcome,
            BuildOutcome::PermanentFailure {
                reason: "Build failed with exit code 2".into()
            }
        );
    }

    #[test]
    fn test_artifact_error_text_is_classified_too() {
        let classifier = FailureClassifier::default();
        let missing = ArtifactResult::Failed("Directory not found: output/dist".into());
        assert_eq!(
            classifier.classify(Some(0), "built", &missing, SECOND),
            BuildOutcome::PermanentFailure {
                reason: "Directory not found: output/dist".into()
            }
        );

        let flaky = ArtifactResult::Failed("upload of index.html: Timeout".into());
        assert!(matches!(
            classifier.classify(Some(0), "built", &flaky, SECOND),
            BuildOutcome::RetryableFailure { .. }
        ));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = FailureClassifier::default();
        let text = "getaddrinfo EAI_AGAIN registry.npmjs.org";
        let first = classifier.classify(Some(1), text, &ArtifactResult::NotAttempted, SECOND);
        for _ in 0..10 {
            assert_eq!(
                classifier.classify(Some(1), text, &ArtifactResult::NotAttempted, SECOND),
                first
            );
        }
    }

    #[test]
    fn test_configured_markers_replace_defaults() {
        let classifier = FailureClassifier::from_config(&ClassifierConfig {
            markers: Some(vec!["503 Service Unavailable".into()]),
        });
        assert!(classifier.is_retryable("got 503 service unavailable from registry"));
        assert!(!classifier.is_retryable("ECONNRESET"));

        let defaults = FailureClassifier::from_config(&ClassifierConfig::default());
        assert_eq!(defaults.markers().len(), DEFAULT_RETRYABLE_MARKERS.len());
    }

    #[test]
    fn test_signal_termination() {
        let classifier = FailureClassifier::default();
        assert!(matches!(
            classifier.classify(None, "", &ArtifactResult::NotAttempted, SECOND),
            BuildOutcome::PermanentFailure { .. }
        ));
    }
}
