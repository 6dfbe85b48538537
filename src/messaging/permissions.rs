//! Role-based communication policy.
//!
//! A single adjacency table keyed by sender role. Entries are one-way: an
//! allowed `A -> B` says nothing about `B -> A`.

use std::collections::{HashMap, HashSet};

use crate::types::Role;

/// Who each role may start or continue a conversation with.
pub const PERMISSION_TABLE: &[(Role, &[Role])] = &[
    (Role::Patient, &[Role::Doctor, Role::Nurse]),
    (
        Role::Doctor,
        &[Role::Patient, Role::Nurse, Role::Admin, Role::Doctor],
    ),
    (
        Role::Nurse,
        &[Role::Patient, Role::Doctor, Role::Admin, Role::Nurse],
    ),
    (
        Role::Admin,
        &[Role::Doctor, Role::Nurse, Role::Admin, Role::Patient],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionMatrix {
    allowed: HashMap<Role, HashSet<Role>>,
}

impl PermissionMatrix {
    /// The portal's policy table.
    pub fn standard() -> Self {
        Self::from_table(PERMISSION_TABLE)
    }

    pub fn from_table(table: &[(Role, &[Role])]) -> Self {
        let mut allowed: HashMap<Role, HashSet<Role>> = HashMap::new();
        for (sender, receivers) in table {
            allowed
                .entry(*sender)
                .or_default()
                .extend(receivers.iter().copied());
        }
        Self { allowed }
    }

    pub fn can_message(&self, sender: Role, receiver: Role) -> bool {
        self.allowed
            .get(&sender)
            .is_some_and(|receivers| receivers.contains(&receiver))
    }

    /// Same lookup for role names coming from outside the type system.
    /// Unknown names are simply not allowed.
    pub fn can_message_by_name(&self, sender: &str, receiver: &str) -> bool {
        match (sender.parse::<Role>(), receiver.parse::<Role>()) {
            (Ok(sender), Ok(receiver)) => self.can_message(sender, receiver),
            _ => false,
        }
    }

    /// Receivers allowed for `sender`, in [`Role::ALL`] order.
    pub fn allowed_receivers(&self, sender: Role) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|receiver| self.can_message(sender, *receiver))
            .collect()
    }
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::Role::*;

    #[test]
    fn standard_table_matches_every_pair() {
        let matrix = PermissionMatrix::standard();
        let expected = [
            (Patient, Patient, false),
            (Patient, Doctor, true),
            (Patient, Nurse, true),
            (Patient, Admin, false),
            (Doctor, Patient, true),
            (Doctor, Doctor, true),
            (Doctor, Nurse, true),
            (Doctor, Admin, true),
            (Nurse, Patient, true),
            (Nurse, Doctor, true),
            (Nurse, Nurse, true),
            (Nurse, Admin, true),
            (Admin, Patient, true),
            (Admin, Doctor, true),
            (Admin, Nurse, true),
            (Admin, Admin, true),
        ];

        for (sender, receiver, allowed) in expected {
            assert_eq!(
                matrix.can_message(sender, receiver),
                allowed,
                "{sender} -> {receiver}"
            );
        }
    }

    #[test]
    fn directions_are_checked_independently() {
        let matrix = PermissionMatrix::standard();

        assert!(matrix.can_message(Admin, Patient));
        assert!(!matrix.can_message(Patient, Admin));
        assert!(!matrix.can_message(Patient, Patient));
    }

    #[test]
    fn custom_table_is_not_made_symmetric() {
        let matrix = PermissionMatrix::from_table(&[(Doctor, &[Patient])]);

        assert!(matrix.can_message(Doctor, Patient));
        assert!(!matrix.can_message(Patient, Doctor));
        assert!(!matrix.can_message(Doctor, Doctor));
    }

    #[test]
    fn unknown_role_names_are_denied() {
        let matrix = PermissionMatrix::standard();

        assert!(matrix.can_message_by_name("Doctor", "patient"));
        assert!(!matrix.can_message_by_name("janitor", "patient"));
        assert!(!matrix.can_message_by_name("doctor", ""));
    }

    #[test]
    fn allowed_receivers_for_patient() {
        let matrix = PermissionMatrix::default();
        assert_eq!(matrix.allowed_receivers(Patient), vec![Doctor, Nurse]);
        assert_eq!(matrix.allowed_receivers(Admin), Role::ALL.to_vec());
    }
}
