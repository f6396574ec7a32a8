//! # Status Helpers
//!
//! Condition bookkeeping shared by the broker, instance and binding reconcilers.
//!
//! Conditions are keyed by type. A condition's `lastTransitionTime` only moves when
//! its status flips; reason and message updates keep the original timestamp. The
//! `lastConditionState` printer column is recalculated on every condition change.

use crate::crd::{
    Condition, ServiceBindingStatus, ServiceBrokerStatus, ServiceInstanceStatus, CONDITION_FALSE,
    CONDITION_TRUE,
};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_FAILED: &str = "Failed";

/// Condition reasons
pub mod reason {
    // Broker
    pub const FETCHED_CATALOG: &str = "FetchedCatalog";
    pub const ERROR_FETCHING_CATALOG: &str = "ErrorFetchingCatalog";
    pub const ERROR_SYNCING_CATALOG: &str = "ErrorSyncingCatalog";
    pub const ERROR_GETTING_AUTH_CREDENTIALS: &str = "ErrorGettingAuthCredentials";

    // Shared by instances and bindings
    pub const ERROR_WITH_PARAMETERS: &str = "ErrorWithParameters";
    pub const STARTING_ORPHAN_MITIGATION: &str = "StartingOrphanMitigation";
    pub const ORPHAN_MITIGATION_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
    pub const ORPHAN_MITIGATION_FAILED: &str = "OrphanMitigationFailed";
    pub const ERROR_POLLING_LAST_OPERATION: &str = "ErrorPollingLastOperation";
    pub const REFERENCES_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";

    // Instance
    pub const REFERENCES_NONEXISTENT_SERVICE_CLASS: &str = "ReferencesNonexistentServiceClass";
    pub const REFERENCES_NONEXISTENT_SERVICE_PLAN: &str = "ReferencesNonexistentServicePlan";
    pub const ERROR_DELETED_SERVICE_PLAN: &str = "ErrorDeletedServicePlan";
    pub const PROVISIONING: &str = "Provisioning";
    pub const PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";
    pub const PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";
    pub const UPDATING_INSTANCE: &str = "UpdatingInstance";
    pub const INSTANCE_UPDATED_SUCCESSFULLY: &str = "InstanceUpdatedSuccessfully";
    pub const UPDATE_INSTANCE_CALL_FAILED: &str = "UpdateInstanceCallFailed";
    pub const DEPROVISIONING: &str = "Deprovisioning";
    pub const DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";
    pub const DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";
    pub const DEPROVISION_BLOCKED_BY_EXISTING_CREDENTIALS: &str =
        "DeprovisionBlockedByExistingCredentials";

    // Binding
    pub const REFERENCES_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";
    pub const ERROR_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
    pub const ERROR_NONBINDABLE_SERVICE_CLASS: &str = "ErrorNonbindableServiceClass";
    pub const BINDING: &str = "Binding";
    pub const INJECTED_BIND_RESULT: &str = "InjectedBindResult";
    pub const BIND_CALL_FAILED: &str = "BindCallFailed";
    pub const ERROR_INJECTING_BIND_RESULT: &str = "ErrorInjectingBindResult";
    pub const UNBINDING: &str = "Unbinding";
    pub const UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";
    pub const UNBIND_CALL_FAILED: &str = "UnbindCallFailed";
}

/// Current time in the RFC3339 form stored in status fields
#[must_use]
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Insert or update a condition in place
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: &str,
) {
    let status = if status { CONDITION_TRUE } else { CONDITION_FALSE };
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition_type) {
        if existing.status != status {
            existing.status = status.to_string();
            existing.last_transition_time = Some(now());
        }
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        return;
    }
    conditions.push(Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(now()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    });
}

#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Printer column value: the last condition's type when true, otherwise its reason
#[must_use]
pub fn last_condition_state(conditions: &[Condition]) -> Option<String> {
    let last = conditions.last()?;
    if last.is_true() {
        Some(last.r#type.clone())
    } else {
        last.reason.clone().or_else(|| Some(last.r#type.clone()))
    }
}

/// Status types carrying Ready/Failed conditions
pub trait ConditionedStatus {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn set_last_condition_state(&mut self, state: Option<String>);

    fn recalculate_printer_columns(&mut self) {
        let state = last_condition_state(self.conditions());
        self.set_last_condition_state(state);
    }

    fn set_ready(&mut self, status: bool, reason: &str, message: &str) {
        set_condition(self.conditions_mut(), CONDITION_READY, status, reason, message);
        self.recalculate_printer_columns();
    }

    /// Record a terminal failure: Ready=False and Failed=True with the same reason
    fn set_failed(&mut self, reason: &str, message: &str) {
        set_condition(self.conditions_mut(), CONDITION_READY, false, reason, message);
        set_condition(self.conditions_mut(), CONDITION_FAILED, true, reason, message);
        self.recalculate_printer_columns();
    }

    fn clear_failed(&mut self) {
        self.conditions_mut().retain(|c| c.r#type != CONDITION_FAILED);
        self.recalculate_printer_columns();
    }

    fn is_ready(&self) -> bool {
        find_condition(self.conditions(), CONDITION_READY).is_some_and(Condition::is_true)
    }

    fn is_failed(&self) -> bool {
        find_condition(self.conditions(), CONDITION_FAILED).is_some_and(Condition::is_true)
    }

    fn ready_reason(&self) -> Option<&str> {
        find_condition(self.conditions(), CONDITION_READY).and_then(|c| c.reason.as_deref())
    }
}

macro_rules! impl_conditioned_status {
    ($status:ty) => {
        impl ConditionedStatus for $status {
            fn conditions(&self) -> &[Condition] {
                &self.conditions
            }

            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.conditions
            }

            fn set_last_condition_state(&mut self, state: Option<String>) {
                self.last_condition_state = state;
            }
        }
    };
}

impl_conditioned_status!(ServiceBrokerStatus);
impl_conditioned_status!(ServiceInstanceStatus);
impl_conditioned_status!(ServiceBindingStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_time_only_moves_on_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, false, "Provisioning", "working");
        conditions[0].last_transition_time = Some("2020-01-01T00:00:00+00:00".to_string());

        set_condition(&mut conditions, CONDITION_READY, false, "Provisioning", "still working");
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00+00:00")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("still working"));

        set_condition(&mut conditions, CONDITION_READY, true, "ProvisionedSuccessfully", "done");
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00+00:00")
        );
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_last_condition_state_uses_type_or_reason() {
        let mut status = ServiceInstanceStatus::default();
        status.set_ready(true, reason::PROVISIONED_SUCCESSFULLY, "ok");
        assert_eq!(status.last_condition_state.as_deref(), Some("Ready"));

        status.set_failed(reason::UPDATE_INSTANCE_CALL_FAILED, "Status: 400");
        assert_eq!(status.last_condition_state.as_deref(), Some("Failed"));
        assert!(!status.is_ready());
        assert!(status.is_failed());

        status.clear_failed();
        status.set_ready(false, reason::UPDATING_INSTANCE, "working");
        assert_eq!(status.last_condition_state.as_deref(), Some("UpdatingInstance"));
    }

    #[test]
    fn test_empty_conditions_have_no_state() {
        assert_eq!(last_condition_state(&[]), None);
    }
}
