//! Status conditions of clusters and pod sets, built on the stackable-operator condition types.
//!
//! Every pass states all three conditions. [`compute_conditions`] carries over the transition
//! time of a condition whose status did not change.

use stackable_operator::status::condition::{
    ClusterCondition, ClusterConditionSet, ClusterConditionStatus, ClusterConditionType,
    ConditionBuilder, HasStatusCondition, compute_conditions,
};

/// The conditions a single pass observed, before timestamps are attached.
#[derive(Debug, Default)]
pub struct PassConditions {
    conditions: Vec<ClusterCondition>,
}

impl PassConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        type_: ClusterConditionType,
        status: ClusterConditionStatus,
        reason: &str,
        message: Option<String>,
    ) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self.conditions.push(ClusterCondition {
            type_,
            status,
            reason: Some(reason.to_string()),
            message,
            last_transition_time: None,
            last_update_time: None,
        });
        self
    }

    /// The conditions to store on `resource`.
    ///
    /// The current conditions are kept as they are when nothing but timestamps would change, so
    /// that a settled resource does not have its status rewritten on every pass.
    pub fn compute<T: HasStatusCondition>(&self, resource: &T) -> Vec<ClusterCondition> {
        let current = resource.conditions();
        let computed = compute_conditions(resource, &[self]);
        if same_conditions(&current, &computed) {
            current
        } else {
            computed
        }
    }
}

impl ConditionBuilder for PassConditions {
    fn build_conditions(&self) -> ClusterConditionSet {
        self.conditions.clone().into()
    }
}

/// Whether both lists hold the same conditions, ignoring timestamps.
pub fn same_conditions(a: &[ClusterCondition], b: &[ClusterCondition]) -> bool {
    a.len() == b.len()
        && a.iter().all(|ca| {
            b.iter().any(|cb| {
                cb.type_ == ca.type_
                    && cb.status == ca.status
                    && cb.reason == ca.reason
                    && cb.message == ca.message
            })
        })
}
