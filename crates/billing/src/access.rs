//! Caller identity for subscriber-facing operations

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Admin,
}

/// Authenticated caller, as resolved by the fronting auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub customer_id: String,
    pub role: Role,
}

impl Actor {
    pub fn customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            role: Role::Customer,
        }
    }

    pub fn admin(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owner or admin, else `Forbidden`
    pub fn ensure_can_access(&self, owner_customer_id: &str) -> BillingResult<()> {
        if self.is_admin() || self.customer_id == owner_customer_id {
            Ok(())
        } else {
            Err(BillingError::Forbidden(
                "caller does not own this resource".to_string(),
            ))
        }
    }
}
