//! Customer directory. Customers are usually born from a lead
//! conversion but can also be created directly; mutation follows the
//! same owner-or-admin gate as leads.

use crm_kernel::{CustomerPatch, Kernel, NewCustomer};
use crm_policy::OwnershipPolicy;
use crm_protocol::{Customer, ListQuery, Paginated, Principal};

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct CustomerDraft {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Clone)]
pub struct CustomerDirectory {
    kernel: Kernel,
    policy: OwnershipPolicy,
}

impl CustomerDirectory {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            policy: OwnershipPolicy::new(),
        }
    }

    fn require(&self, id: i64) -> Result<Customer, CoreError> {
        self.kernel
            .get_customer(id, false)?
            .ok_or_else(|| CoreError::NotFound("customer not found".into()))
    }

    pub fn create(&self, principal: &Principal, draft: &CustomerDraft) -> Result<Customer, CoreError> {
        if principal.id <= 0 {
            return Err(CoreError::Forbidden("invalid token payload (missing id)".into()));
        }
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("name must not be empty".into()));
        }
        Ok(self.kernel.insert_customer(&NewCustomer {
            name: name.to_string(),
            email: draft.email.clone(),
            phone: draft.phone.clone(),
            company: draft.company.clone(),
            owner_id: principal.id,
        })?)
    }

    pub fn get(&self, id: i64) -> Result<Customer, CoreError> {
        self.require(id)
    }

    pub fn list(&self, query: &ListQuery) -> Result<Paginated<Customer>, CoreError> {
        Ok(self.kernel.list_customers(query)?)
    }

    pub fn update(
        &self,
        principal: &Principal,
        id: i64,
        patch: &CustomerPatch,
    ) -> Result<Customer, CoreError> {
        let existing = self.require(id)?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(CoreError::Validation("name must not be empty".into()));
        }
        self.kernel
            .update_customer(id, patch)?
            .ok_or_else(|| CoreError::NotFound("customer not found".into()))
    }

    pub fn soft_delete(&self, principal: &Principal, id: i64) -> Result<(), CoreError> {
        let existing = self.require(id)?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if !self.kernel.soft_delete_customer(id)? {
            return Err(CoreError::NotFound("customer not found".into()));
        }
        Ok(())
    }

    pub fn restore(&self, principal: &Principal, id: i64) -> Result<Customer, CoreError> {
        let existing = self
            .kernel
            .get_customer(id, true)?
            .ok_or_else(|| CoreError::NotFound("customer not found".into()))?;
        self.policy.ensure_can_mutate(principal, existing.owner_id)?;
        if !self.kernel.restore_customer(id)? {
            return Err(CoreError::NotFound("customer not found or not deleted".into()));
        }
        self.require(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_protocol::Role;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, CustomerDirectory) {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        (dir, CustomerDirectory::new(kernel))
    }

    fn principal(id: i64, role: Role) -> Principal {
        Principal {
            id,
            role,
            email: format!("u{id}@example.com"),
        }
    }

    #[test]
    fn direct_creation_assigns_caller_as_owner() {
        let (_dir, customers) = setup();
        let customer = customers
            .create(
                &principal(7, Role::User),
                &CustomerDraft {
                    name: "Globex".into(),
                    email: None,
                    phone: None,
                    company: Some("Globex Corp".into()),
                },
            )
            .unwrap();
        assert_eq!(customer.owner_id, 7);
        assert_eq!(customer.company.as_deref(), Some("Globex Corp"));
    }

    #[test]
    fn foreign_user_cannot_delete() {
        let (_dir, customers) = setup();
        let customer = customers
            .create(
                &principal(7, Role::User),
                &CustomerDraft {
                    name: "Globex".into(),
                    email: None,
                    phone: None,
                    company: None,
                },
            )
            .unwrap();
        let res = customers.soft_delete(&principal(8, Role::User), customer.id);
        assert!(matches!(res, Err(CoreError::Forbidden(_))));
        customers
            .soft_delete(&principal(1, Role::Admin), customer.id)
            .unwrap();
        assert!(matches!(customers.get(customer.id), Err(CoreError::NotFound(_))));
    }
}
