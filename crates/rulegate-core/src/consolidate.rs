use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::{ConsolidatedResult, Criticality, RuleStatus, RuleVerdict, Settings};

/// How many medium/low failures a run tolerates. High-criticality failures are
/// never tolerated. The defaults require every rule to pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationPolicy {
    pub medium_failure_threshold: usize,
    pub low_failure_threshold: usize,
    /// Count an undetermined medium/low rule as a failure
    pub undetermined_counts_as_failure: bool,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self {
            medium_failure_threshold: 0,
            low_failure_threshold: 0,
            undetermined_counts_as_failure: true,
        }
    }
}

impl From<&Settings> for ConsolidationPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            medium_failure_threshold: settings.medium_failure_threshold,
            low_failure_threshold: settings.low_failure_threshold,
            undetermined_counts_as_failure: settings.undetermined_counts_as_failure,
        }
    }
}

impl ConsolidationPolicy {
    fn counts_as_failure(&self, verdict: &RuleVerdict) -> bool {
        match (verdict.status, verdict.criticality) {
            (RuleStatus::Compliant, _) => false,
            (RuleStatus::NonCompliant, _) => true,
            (RuleStatus::Undetermined, Criticality::High) => true,
            (RuleStatus::Undetermined, _) => self.undetermined_counts_as_failure,
        }
    }
}

/// Merge every rule verdict into the final decision. Order of the input does
/// not matter; the result lists verdicts by descending criticality then id.
pub fn consolidate(mut verdicts: Vec<RuleVerdict>, policy: &ConsolidationPolicy) -> ConsolidatedResult {
    verdicts.sort_by(|a, b| {
        b.criticality
            .cmp(&a.criticality)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    let failures = |c: Criticality| {
        verdicts
            .iter()
            .filter(|v| v.criticality == c && policy.counts_as_failure(v))
            .count()
    };
    let high_failures = failures(Criticality::High);
    let medium_failures = failures(Criticality::Medium);
    let low_failures = failures(Criticality::Low);
    let undetermined = verdicts.iter().filter(|v| v.is_undetermined()).count();

    let passed = high_failures == 0
        && medium_failures <= policy.medium_failure_threshold
        && low_failures <= policy.low_failure_threshold;

    let problems: Vec<&RuleVerdict> = verdicts.iter().filter(|v| !v.is_compliant()).collect();
    let total = verdicts.len();

    let mut message = if passed && problems.is_empty() {
        format!("All {total} rules passed validation.")
    } else if passed {
        format!(
            "Validation passed with {} warning(s) across {total} rules:",
            problems.len()
        )
    } else {
        let reason = if high_failures > 0 {
            format!("{high_failures} high-criticality rule(s) did not pass")
        } else if medium_failures > policy.medium_failure_threshold {
            format!(
                "{medium_failures} medium-criticality rule(s) did not pass (tolerated: {})",
                policy.medium_failure_threshold
            )
        } else {
            format!(
                "{low_failures} low-criticality rule(s) did not pass (tolerated: {})",
                policy.low_failure_threshold
            )
        };
        format!("Validation failed: {reason}. {} of {total} rules need attention:", problems.len())
    };

    for v in &problems {
        let _ = write!(
            message,
            "\n- [{}] {} ({}): ",
            v.criticality.as_str().to_uppercase(),
            v.rule_id,
            v.description
        );
        message.push_str(match (v.status, v.cancelled) {
            (RuleStatus::NonCompliant, _) => "non-compliant",
            (_, true) => "cancelled",
            _ => "undetermined",
        });
        let evidence: Vec<String> = v
            .evidence
            .iter()
            .map(|e| e.to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if !evidence.is_empty() {
            let _ = write!(message, ". Evidence: {}", evidence.join("; "));
        }
    }

    tracing::info!(
        passed,
        total,
        high_failures,
        medium_failures,
        low_failures,
        undetermined,
        "consolidated rule verdicts"
    );

    ConsolidatedResult {
        passed,
        message,
        total_rules: total,
        high_failures,
        medium_failures,
        low_failures,
        undetermined,
        rule_verdicts: verdicts,
        unread_files: Vec::new(),
    }
}

/// Files named in the message before the rest are only counted.
const UNREAD_LISTED: usize = 10;

/// Record files whose text never reached a model. The decision is unchanged;
/// the message says which files were not looked at.
pub fn note_unread(result: &mut ConsolidatedResult, unread: &[String]) {
    if unread.is_empty() {
        return;
    }
    let shown: Vec<&str> = unread.iter().take(UNREAD_LISTED).map(String::as_str).collect();
    let _ = write!(
        result.message,
        "\nNote: {} file(s) could not be read and were not validated: {}",
        unread.len(),
        shown.join(", ")
    );
    if unread.len() > UNREAD_LISTED {
        let _ = write!(result.message, " and {} more", unread.len() - UNREAD_LISTED);
    }
    result.unread_files = unread.to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Category, Evidence};

    fn verdict(id: &str, criticality: Criticality, status: RuleStatus) -> RuleVerdict {
        RuleVerdict {
            rule_id: id.into(),
            description: format!("{id} description"),
            category: Category::Content,
            criticality,
            status,
            cancelled: false,
            evidence: match status {
                RuleStatus::Compliant => vec![],
                _ => vec![Evidence {
                    quote: format!("{id} evidence"),
                    location: "openapi.yaml".into(),
                }],
            },
            models: vec!["m".into()],
            chunks: 1,
        }
    }

    #[test]
    fn all_compliant_passes_with_no_failures_listed() {
        let verdicts = (0..6)
            .map(|i| verdict(&format!("r{i}"), Criticality::Medium, RuleStatus::Compliant))
            .collect();
        let result = consolidate(verdicts, &ConsolidationPolicy::default());
        assert!(result.passed);
        assert_eq!(result.message, "All 6 rules passed validation.");
        assert_eq!(result.rule_verdicts.len(), 6);
    }

    #[test]
    fn high_failure_fails_even_with_lenient_policy() {
        let lenient = ConsolidationPolicy {
            medium_failure_threshold: 10,
            low_failure_threshold: 10,
            undetermined_counts_as_failure: false,
        };
        for status in [RuleStatus::NonCompliant, RuleStatus::Undetermined] {
            let result = consolidate(
                vec![
                    verdict("ok", Criticality::Low, RuleStatus::Compliant),
                    verdict("status-code", Criticality::High, status),
                ],
                &lenient,
            );
            assert!(!result.passed);
            assert_eq!(result.high_failures, 1);
            assert!(result.message.contains("status-code"));
            assert!(result.message.contains("\"status-code evidence\" at openapi.yaml"));
        }
    }

    #[test]
    fn failures_are_listed_by_descending_criticality() {
        let result = consolidate(
            vec![
                verdict("low-a", Criticality::Low, RuleStatus::NonCompliant),
                verdict("high-b", Criticality::High, RuleStatus::Undetermined),
                verdict("med-c", Criticality::Medium, RuleStatus::NonCompliant),
                verdict("high-a", Criticality::High, RuleStatus::NonCompliant),
            ],
            &ConsolidationPolicy::default(),
        );
        let order: Vec<usize> = ["high-a", "high-b", "med-c", "low-a"]
            .iter()
            .map(|id| result.message.find(id).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{}", result.message);
        assert!(result.message.contains("[HIGH] high-b (high-b description): undetermined"));
    }

    #[test]
    fn thresholds_tolerate_medium_and_low_failures() {
        let policy = ConsolidationPolicy {
            medium_failure_threshold: 1,
            low_failure_threshold: 2,
            undetermined_counts_as_failure: true,
        };
        let result = consolidate(
            vec![
                verdict("m1", Criticality::Medium, RuleStatus::NonCompliant),
                verdict("l1", Criticality::Low, RuleStatus::NonCompliant),
                verdict("l2", Criticality::Low, RuleStatus::Undetermined),
            ],
            &policy,
        );
        assert!(result.passed);
        assert!(result.message.starts_with("Validation passed with 3 warning(s)"));

        let result = consolidate(
            vec![
                verdict("m1", Criticality::Medium, RuleStatus::NonCompliant),
                verdict("m2", Criticality::Medium, RuleStatus::Undetermined),
            ],
            &policy,
        );
        assert!(!result.passed);
        assert!(result.message.contains("2 medium-criticality rule(s) did not pass (tolerated: 1)"));
    }

    #[test]
    fn strict_default_fails_on_single_low_failure() {
        let result = consolidate(
            vec![verdict("l1", Criticality::Low, RuleStatus::NonCompliant)],
            &ConsolidationPolicy::default(),
        );
        assert!(!result.passed);
        assert_eq!(result.low_failures, 1);
    }

    #[test]
    fn undetermined_low_can_be_advisory() {
        let policy = ConsolidationPolicy {
            undetermined_counts_as_failure: false,
            ..Default::default()
        };
        let result = consolidate(
            vec![verdict("l1", Criticality::Low, RuleStatus::Undetermined)],
            &policy,
        );
        assert!(result.passed);
        assert_eq!(result.undetermined, 1);
        assert_eq!(result.low_failures, 0);
    }

    #[test]
    fn unread_files_are_named_without_changing_the_decision() {
        let mut result = consolidate(
            vec![verdict("ok", Criticality::High, RuleStatus::Compliant)],
            &ConsolidationPolicy::default(),
        );
        let unread: Vec<String> = (0..12).map(|i| format!("docs/{i}.md")).collect();
        note_unread(&mut result, &unread);

        assert!(result.passed);
        assert!(result.message.starts_with("All 1 rules passed validation.\nNote: 12 file(s)"));
        assert!(result.message.contains("docs/0.md, docs/1.md"));
        assert!(!result.message.contains("docs/10.md"));
        assert!(result.message.ends_with(" and 2 more"));
        assert_eq!(result.unread_files.len(), 12);
    }

    #[test]
    fn consolidation_ignores_input_order() {
        let a = vec![
            verdict("x", Criticality::Medium, RuleStatus::NonCompliant),
            verdict("y", Criticality::High, RuleStatus::Compliant),
            verdict("z", Criticality::Low, RuleStatus::Undetermined),
        ];
        let mut b = a.clone();
        b.reverse();
        let ra = consolidate(a, &ConsolidationPolicy::default());
        let rb = consolidate(b, &ConsolidationPolicy::default());
        assert_eq!(ra.passed, rb.passed);
        assert_eq!(ra.message, rb.message);
    }
}
