//! Manual category overrides, checked before any built-in rule.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid override file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid override pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("override for {category:?} has no patterns")]
    Empty { category: String },
}

/// One override entry as stored in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryOverride {
    pub patterns: Vec<String>,
    pub category: String,
    #[serde(default)]
    pub priority: i64,
}

/// A compiled pattern. Anything containing `\b` is a case-insensitive regex;
/// everything else is a lowercase substring.
#[derive(Debug, Clone)]
pub enum OverridePattern {
    Substring(String),
    WordBoundary(Regex),
}

impl OverridePattern {
    pub fn compile(raw: &str) -> Result<Self, OverrideError> {
        if raw.contains(r"\b") {
            let re = RegexBuilder::new(raw)
                .case_insensitive(true)
                .build()
                .map_err(|source| OverrideError::Regex {
                    pattern: raw.to_string(),
                    source,
                })?;
            Ok(Self::WordBoundary(re))
        } else {
            Ok(Self::Substring(raw.trim().to_lowercase()))
        }
    }

    /// `text` must already be lowercased.
    pub fn matches(&self, text: &str) -> bool {
        match self {
            Self::Substring(s) => !s.is_empty() && text.contains(s.as_str()),
            Self::WordBoundary(re) => re.is_match(text),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledOverride {
    pub category: String,
    pub priority: i64,
    pub patterns: Vec<OverridePattern>,
}

/// Compile and sort by priority, highest first. Equal priorities keep input order.
pub(crate) fn compile_overrides(
    overrides: &[CategoryOverride],
) -> Result<Vec<CompiledOverride>, OverrideError> {
    let mut compiled = overrides
        .iter()
        .map(|o| {
            if o.patterns.is_empty() {
                return Err(OverrideError::Empty {
                    category: o.category.clone(),
                });
            }
            let patterns = o
                .patterns
                .iter()
                .map(|p| OverridePattern::compile(p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledOverride {
                category: o.category.clone(),
                priority: o.priority,
                patterns,
            })
        })
        .collect::<Result<Vec<_>, OverrideError>>()?;
    compiled.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(compiled)
}

/// Load a JSON array of overrides.
pub fn load_overrides_json(path: impl AsRef<Path>) -> Result<Vec<CategoryOverride>, OverrideError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_boundary_pattern_ignores_embedded_letters() {
        let p = OverridePattern::compile(r"\blp\b").unwrap();
        assert!(p.matches("beatles abbey road lp"));
        assert!(!p.matches("help! soundtrack"));
        assert!(!p.matches("alpine jacket"));
    }

    #[test]
    fn word_boundary_pattern_is_case_insensitive() {
        let p = OverridePattern::compile(r"\bEP\b").unwrap();
        assert!(p.matches("limited ep"));
    }

    #[test]
    fn plain_pattern_is_a_substring() {
        let p = OverridePattern::compile("Pyrex").unwrap();
        assert!(p.matches("vintage pyrex bowl"));
        assert!(matches!(p, OverridePattern::Substring(_)));
    }

    #[test]
    fn invalid_regex_is_reported() {
        let err = OverridePattern::compile(r"\b(unclosed").unwrap_err();
        assert!(matches!(err, OverrideError::Regex { .. }));
    }

    #[test]
    fn compiled_overrides_sort_by_priority() {
        let compiled = compile_overrides(&[
            CategoryOverride {
                patterns: vec!["a".into()],
                category: "low".into(),
                priority: 1,
            },
            CategoryOverride {
                patterns: vec!["a".into()],
                category: "high".into(),
                priority: 100,
            },
        ])
        .unwrap();
        assert_eq!(compiled[0].category, "high");
    }

    #[test]
    fn empty_pattern_list_is_rejected() {
        let err = compile_overrides(&[CategoryOverride {
            patterns: vec![],
            category: "x".into(),
            priority: 0,
        }])
        .unwrap_err();
        assert!(matches!(err, OverrideError::Empty { .. }));
    }
}
