use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Something a principal is allowed to do. Evaluated once per operation
/// against the resource it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Create, pay for and cancel bookings the principal owns.
    BookTours,
    /// Read any booking regardless of owner.
    ViewAnyBooking,
    /// Advance bookings through supplier-side states (confirm, complete).
    ManageBookings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Guest,
    Customer,
    Supplier,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "GUEST",
            Role::Customer => "CUSTOMER",
            Role::Supplier => "SUPPLIER",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GUEST" => Some(Role::Guest),
            "CUSTOMER" => Some(Role::Customer),
            "SUPPLIER" => Some(Role::Supplier),
            "ADMIN" | "SUPER_ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> HashSet<Capability> {
        let caps: &[Capability] = match self {
            Role::Guest | Role::Customer => &[Capability::BookTours],
            Role::Supplier => &[Capability::ViewAnyBooking, Capability::ManageBookings],
            Role::Admin => &[
                Capability::BookTours,
                Capability::ViewAnyBooking,
                Capability::ManageBookings,
            ],
        };
        caps.iter().copied().collect()
    }
}

/// The authenticated caller of a core operation.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    capabilities: HashSet<Capability>,
}

impl Principal {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self {
            user_id,
            capabilities: role.capabilities(),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> CoreResult<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!("missing capability {:?}", capability)))
        }
    }

    /// Capability over a resource owned by `owner_id`: the principal must hold
    /// the capability and own the resource.
    pub fn require_owner(&self, capability: Capability, owner_id: Uuid) -> CoreResult<()> {
        self.require(capability)?;
        if self.user_id != owner_id {
            return Err(CoreError::PermissionDenied(
                "resource belongs to another user".to_string(),
            ));
        }
        Ok(())
    }

    pub fn can_view(&self, owner_id: Uuid) -> bool {
        self.user_id == owner_id || self.has(Capability::ViewAnyBooking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_check_requires_both_capability_and_ownership() {
        let user = Uuid::new_v4();
        let customer = Principal::new(user, Role::Customer);
        assert!(customer.require_owner(Capability::BookTours, user).is_ok());
        assert!(matches!(
            customer.require_owner(Capability::BookTours, Uuid::new_v4()),
            Err(CoreError::PermissionDenied(_))
        ));

        let supplier = Principal::new(user, Role::Supplier);
        assert!(supplier.require_owner(Capability::BookTours, user).is_err());
        assert!(supplier.can_view(Uuid::new_v4()));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::parse("SUPER_ADMIN"), Some(Role::Admin));
        assert_eq!(Role::parse("GUEST"), Some(Role::Guest));
        assert_eq!(Role::parse("root"), None);
    }
}
