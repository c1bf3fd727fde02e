//! Error pattern engine

use std::collections::HashSet;

use crate::classify::patterns::{default_patterns, ErrorPattern};
use crate::errors::ProvisionError;
use crate::utils::{sha256_hash, truncate_chars};

/// Characters of output that feed a fingerprint
const FINGERPRINT_PREFIX_CHARS: usize = 200;

/// Matches failure output against the pattern table.
///
/// Owned by one deployment, so identical failures on different hosts are
/// reported independently.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<ErrorPattern>,
    seen: HashSet<String>,
}

impl ErrorClassifier {
    pub fn new(patterns: Vec<ErrorPattern>) -> Self {
        Self {
            patterns,
            seen: HashSet::new(),
        }
    }

    /// Classifier over the built-in table
    pub fn with_defaults() -> Result<Self, ProvisionError> {
        Ok(Self::new(default_patterns()?))
    }

    /// Every pattern matching `text`, in table order, without deduplication
    pub fn matches(&self, text: &str) -> Vec<&ErrorPattern> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        self.patterns.iter().filter(|p| p.is_match(text)).collect()
    }

    /// Matching patterns not reported before for the same output
    ///
    /// Callers must only pass output of commands that failed.
    pub fn classify(&mut self, text: &str) -> Vec<ErrorPattern> {
        let digest = sha256_hash(truncate_chars(text, FINGERPRINT_PREFIX_CHARS).as_bytes());

        let matched: Vec<ErrorPattern> = self.matches(text).into_iter().cloned().collect();
        matched
            .into_iter()
            .filter(|pattern| self.seen.insert(fingerprint(&pattern.description, &digest)))
            .collect()
    }
}

fn fingerprint(description: &str, digest: &str) -> String {
    format!("{}:{}", description, &digest[..16])
}
