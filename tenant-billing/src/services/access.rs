//! Request-time gate combining role permission and billing status.

use super::store::OrganizationStore;
use crate::error::BillingError;
use crate::models::{BillingStatus, Organization, StatusAccess};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Role {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Viewer => "viewer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Mutate,
}

/// A guarded operation: what it does and who may do it.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub name: &'static str,
    pub mode: AccessMode,
    pub allowed_roles: &'static [Role],
}

impl Operation {
    pub const fn read(name: &'static str, allowed_roles: &'static [Role]) -> Self {
        Self {
            name,
            mode: AccessMode::Read,
            allowed_roles,
        }
    }

    pub const fn mutate(name: &'static str, allowed_roles: &'static [Role]) -> Self {
        Self {
            name,
            mode: AccessMode::Mutate,
            allowed_roles,
        }
    }
}

pub const ALL_ROLES: &[Role] = &[Role::Owner, Role::Admin, Role::Member, Role::Viewer];
pub const WRITERS: &[Role] = &[Role::Owner, Role::Admin, Role::Member];
pub const MANAGERS: &[Role] = &[Role::Owner, Role::Admin];
pub const OWNERS: &[Role] = &[Role::Owner];

pub const VIEW_USAGE: Operation = Operation::read("view usage", ALL_ROLES);
pub const RESERVE_USAGE: Operation = Operation::mutate("reserve usage", WRITERS);
pub const RELEASE_USAGE: Operation = Operation::mutate("release usage", WRITERS);
pub const CREATE_PAYMENT_LINK: Operation = Operation::mutate("create payment links", MANAGERS);
pub const REFRESH_PAYMENT: Operation = Operation::mutate("refresh invoice payments", MANAGERS);
pub const VIEW_BILLING_EVENTS: Operation = Operation::read("view billing events", OWNERS);

/// Role check. Owners pass every operation.
pub fn check_role(role: Role, operation: &Operation) -> Result<(), BillingError> {
    if role == Role::Owner || operation.allowed_roles.contains(&role) {
        Ok(())
    } else {
        Err(BillingError::Forbidden(operation.name))
    }
}

/// Billing check against an already-resolved status.
///
/// Canceled and blocked organizations are denied outright, owners
/// included. Degraded statuses keep read access only.
pub fn check_billing(status: BillingStatus, mode: AccessMode) -> Result<(), BillingError> {
    match (status.access(), mode) {
        (StatusAccess::Full, _) | (StatusAccess::ReadOnly, AccessMode::Read) => Ok(()),
        (StatusAccess::ReadOnly, AccessMode::Mutate) => {
            Err(BillingError::BillingInactive { status })
        }
        (StatusAccess::Denied, _) => Err(BillingError::AccessDenied(format!(
            "subscription is {}",
            status
        ))),
    }
}

/// Both checks, role first.
pub fn authorize_with(
    org: &Organization,
    role: Role,
    operation: &Operation,
    now: DateTime<Utc>,
) -> Result<BillingStatus, BillingError> {
    check_role(role, operation)?;
    let status = org.effective_status(now);
    check_billing(status, operation.mode)?;
    Ok(status)
}

/// Loads the organization fresh on every call; nothing is cached.
#[derive(Clone)]
pub struct AccessGuard<S> {
    store: S,
}

impl<S: OrganizationStore> AccessGuard<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(skip(self, operation), fields(operation = operation.name))]
    pub async fn authorize(
        &self,
        organization_id: Uuid,
        role: Role,
        operation: &Operation,
    ) -> Result<BillingStatus, BillingError> {
        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("organization".to_string()))?;

        let status = authorize_with(&org, role, operation, Utc::now())?;
        debug!(status = %status, role = role.as_str(), "Access granted");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn org_with(status: Option<BillingStatus>, legacy: Option<&str>) -> Organization {
        let mut org = Organization::new("Acme", Utc::now());
        org.billing_status = status;
        org.legacy_status = legacy.map(str::to_string);
        org
    }

    #[test]
    fn roles_outside_the_allowed_set_are_forbidden() {
        assert!(check_role(Role::Viewer, &RESERVE_USAGE).is_err());
        assert!(check_role(Role::Member, &CREATE_PAYMENT_LINK).is_err());
        assert!(check_role(Role::Admin, &CREATE_PAYMENT_LINK).is_ok());
        assert!(check_role(Role::Owner, &VIEW_BILLING_EVENTS).is_ok());
        assert!(check_role(Role::Admin, &VIEW_BILLING_EVENTS).is_err());
    }

    #[test]
    fn billing_matrix() {
        use AccessMode::*;
        for status in [BillingStatus::TrialActive, BillingStatus::Active] {
            assert!(check_billing(status, Read).is_ok());
            assert!(check_billing(status, Mutate).is_ok());
        }
        for status in [
            BillingStatus::TrialEnded,
            BillingStatus::PastDue,
            BillingStatus::BillingPendingReview,
        ] {
            assert!(check_billing(status, Read).is_ok());
            assert!(matches!(
                check_billing(status, Mutate),
                Err(BillingError::BillingInactive { status: s }) if s == status
            ));
        }
        for status in [BillingStatus::Canceled, BillingStatus::Blocked] {
            assert!(matches!(check_billing(status, Read), Err(BillingError::AccessDenied(_))));
            assert!(matches!(check_billing(status, Mutate), Err(BillingError::AccessDenied(_))));
        }
    }

    #[test]
    fn owner_is_still_denied_when_canceled() {
        let org = org_with(Some(BillingStatus::Canceled), None);
        let err = authorize_with(&org, Role::Owner, &VIEW_USAGE, Utc::now()).unwrap_err();
        assert!(matches!(err, BillingError::AccessDenied(_)));
    }

    #[test]
    fn legacy_inactive_record_is_denied() {
        let org = org_with(None, Some("inactive"));
        assert!(authorize_with(&org, Role::Owner, &VIEW_USAGE, Utc::now()).is_err());

        let org = org_with(None, Some("active"));
        assert_eq!(
            authorize_with(&org, Role::Member, &RESERVE_USAGE, Utc::now()).unwrap(),
            BillingStatus::Active
        );
    }

    #[test]
    fn expired_trial_degrades_to_read_only() {
        let now = Utc::now();
        let mut org = org_with(Some(BillingStatus::TrialActive), None);
        org.trial_expires_at = Some(now - Duration::hours(1));

        assert!(authorize_with(&org, Role::Member, &VIEW_USAGE, now).is_ok());
        let err = authorize_with(&org, Role::Member, &RESERVE_USAGE, now).unwrap_err();
        assert!(matches!(
            err,
            BillingError::BillingInactive {
                status: BillingStatus::TrialEnded
            }
        ));
    }
}
