//! Eligibility classification: which outbound queue, if any, a subject belongs in.

use std::collections::HashSet;

use crate::config::ReconcilerConfig;
use crate::routing::types::{CallSubject, QueueCategory, Requirement};

/// Requirement-type filters applied by the classifier
#[derive(Debug, Clone, Default)]
pub struct EligibilityRules {
    excluded_types: HashSet<String>,
    base_requirement_type: Option<String>,
}

impl EligibilityRules {
    pub fn new<I, S>(excluded_types: I, base_requirement_type: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded_types: excluded_types.into_iter().map(Into::into).collect(),
            base_requirement_type,
        }
    }

    pub fn from_config(config: &ReconcilerConfig) -> Self {
        let base = Some(config.base_requirement_type.clone()).filter(|b| !b.is_empty());
        Self::new(config.excluded_requirement_types.iter().cloned(), base)
    }

    /// A pending requirement that should put a signed subject in the outstanding queue
    pub fn is_qualifying(&self, requirement: &Requirement) -> bool {
        requirement.is_pending()
            && !self.excluded_types.contains(requirement.requirement_type.as_str())
            && self.base_requirement_type.as_deref() != Some(requirement.requirement_type.as_str())
    }
}

/// Classify a subject. First matching rule wins:
///
/// 1. unreachable, or every claim cancelled → `Ineligible`
/// 2. no signature → `Unsigned`
/// 3. a qualifying pending requirement on a live claim → `Outstanding`
/// 4. otherwise → `Ineligible`
pub fn classify(subject: &CallSubject, rules: &EligibilityRules) -> QueueCategory {
    if !subject.is_reachable() || subject.all_claims_cancelled() {
        return QueueCategory::Ineligible;
    }

    if !subject.signed {
        return QueueCategory::Unsigned;
    }

    let outstanding = subject
        .live_claims()
        .flat_map(|claim| claim.requirements.iter())
        .any(|req| rules.is_qualifying(req));

    if outstanding {
        QueueCategory::Outstanding
    } else {
        QueueCategory::Ineligible
    }
}

/// Number of qualifying pending requirements across live claims
pub fn pending_requirement_count(subject: &CallSubject, rules: &EligibilityRules) -> usize {
    subject
        .live_claims()
        .flat_map(|claim| claim.requirements.iter())
        .filter(|req| rules.is_qualifying(req))
        .count()
}
