use serde::Serialize;

use crate::{Category, Criticality, Rule, Settings};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Economy,
    Premium,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub id: String,
    /// Largest chunk, in bytes, this model is handed in one prompt
    pub budget_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub economy: ModelProfile,
    pub premium: ModelProfile,
    /// Largest directory structure, in bytes, rendered into one prompt
    pub max_tree_bytes: usize,
}

impl ModelCatalog {
    pub fn profile(&self, tier: ModelTier) -> &ModelProfile {
        match tier {
            ModelTier::Economy => &self.economy,
            ModelTier::Premium => &self.premium,
        }
    }
}

impl From<&Settings> for ModelCatalog {
    fn from(settings: &Settings) -> Self {
        Self {
            economy: ModelProfile {
                id: settings.economy_model.clone(),
                budget_bytes: settings.economy_budget_bytes,
            },
            premium: ModelProfile {
                id: settings.premium_model.clone(),
                budget_bytes: settings.premium_budget_bytes,
            },
            max_tree_bytes: settings.max_tree_bytes,
        }
    }
}

/// Primary model for a rule plus the models tried, in order, when it fails.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelChoice {
    pub tier: ModelTier,
    pub primary: String,
    pub fallbacks: Vec<String>,
    /// Chunk budget every model in this choice can accept
    pub budget_bytes: usize,
}

impl ModelChoice {
    pub fn next_fallback(&self) -> Option<&str> {
        self.fallbacks.first().map(String::as_str)
    }
}

pub fn tier_for(rule: &Rule) -> ModelTier {
    if rule.category == Category::Semantic || rule.criticality == Criticality::High {
        ModelTier::Premium
    } else {
        ModelTier::Economy
    }
}

pub fn select_model(rule: &Rule, catalog: &ModelCatalog) -> ModelChoice {
    let tier = tier_for(rule);
    let other = match tier {
        ModelTier::Economy => ModelTier::Premium,
        ModelTier::Premium => ModelTier::Economy,
    };
    let primary = catalog.profile(tier);
    let fallback = catalog.profile(other);

    let mut fallbacks = Vec::new();
    let mut budget_bytes = primary.budget_bytes;
    if fallback.id != primary.id {
        fallbacks.push(fallback.id.clone());
        budget_bytes = budget_bytes.min(fallback.budget_bytes);
    }

    ModelChoice {
        tier,
        primary: primary.id.clone(),
        fallbacks,
        budget_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scope;

    fn rule(category: Category, criticality: Criticality) -> Rule {
        Rule {
            id: "r".into(),
            description: "d".into(),
            category,
            criticality,
            scope: Scope::all(),
            explanation: None,
        }
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog {
            economy: ModelProfile {
                id: "haiku".into(),
                budget_bytes: 1_000,
            },
            premium: ModelProfile {
                id: "sonnet".into(),
                budget_bytes: 4_000,
            },
            max_tree_bytes: 2_000,
        }
    }

    #[test]
    fn cheap_tier_for_structural_and_content() {
        let c = catalog();
        for category in [Category::Structural, Category::Content] {
            for crit in [Criticality::Low, Criticality::Medium] {
                let choice = select_model(&rule(category, crit), &c);
                assert_eq!(choice.tier, ModelTier::Economy);
                assert_eq!(choice.primary, "haiku");
                assert_eq!(choice.fallbacks, ["sonnet"]);
                assert_eq!(choice.budget_bytes, 1_000);
            }
        }
    }

    #[test]
    fn premium_tier_for_semantic_or_high() {
        let c = catalog();
        let semantic = select_model(&rule(Category::Semantic, Criticality::Low), &c);
        let high = select_model(&rule(Category::Structural, Criticality::High), &c);
        for choice in [semantic, high] {
            assert_eq!(choice.tier, ModelTier::Premium);
            assert_eq!(choice.primary, "sonnet");
            assert_eq!(choice.next_fallback(), Some("haiku"));
            // never hand the fallback a chunk it cannot take
            assert_eq!(choice.budget_bytes, 1_000);
        }
    }

    #[test]
    fn same_model_in_both_tiers_has_no_fallback() {
        let mut c = catalog();
        c.premium.id = "haiku".into();
        let choice = select_model(&rule(Category::Semantic, Criticality::High), &c);
        assert!(choice.fallbacks.is_empty());
        assert_eq!(choice.budget_bytes, 4_000);
    }
}
