//! Item category classification.
//!
//! Three stages, first match wins: manual overrides (highest priority first),
//! ordered name rules, keyword scoring. The result is never empty; unmatched
//! items land in [`UNCATEGORIZED`].

pub mod keywords;
pub mod overrides;
pub mod rules;

use serde::Serialize;

pub use overrides::{load_overrides_json, CategoryOverride, OverrideError, OverridePattern};
use overrides::{compile_overrides, CompiledOverride};

pub const UNCATEGORIZED: &str = "uncategorized";

/// Which stage produced the category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ClassificationSource {
    Override { priority: i64 },
    NameRule,
    Keywords { score: usize },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: String,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, Default)]
pub struct CategoryClassifier {
    overrides: Vec<CompiledOverride>,
}

impl CategoryClassifier {
    /// Classifier with built-in rules only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: &[CategoryOverride]) -> Result<Self, OverrideError> {
        Ok(Self {
            overrides: compile_overrides(overrides)?,
        })
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    pub fn classify(&self, name: &str, description: Option<&str>) -> String {
        self.classify_detailed(name, description).category
    }

    pub fn classify_detailed(&self, name: &str, description: Option<&str>) -> Classification {
        let name_lower = name.to_lowercase();
        let full_text = match description {
            Some(d) if !d.trim().is_empty() => format!("{name_lower} {}", d.to_lowercase()),
            _ => name_lower.clone(),
        };

        for o in &self.overrides {
            if o.patterns.iter().any(|p| p.matches(&full_text)) {
                return Classification {
                    category: o.category.clone(),
                    source: ClassificationSource::Override {
                        priority: o.priority,
                    },
                };
            }
        }

        if let Some(category) = rules::match_name(&name_lower) {
            return Classification {
                category: category.to_string(),
                source: ClassificationSource::NameRule,
            };
        }

        if let Some((category, score)) = keywords::best_category(&full_text) {
            return Classification {
                category: category.to_string(),
                source: ClassificationSource::Keywords { score },
            };
        }

        Classification {
            category: UNCATEGORIZED.to_string(),
            source: ClassificationSource::Fallback,
        }
    }
}
