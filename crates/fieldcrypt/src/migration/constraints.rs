//! Foreign-key repair around encryption.
//!
//! A foreign key that joins on a plaintext email cannot hold once either side
//! carries randomised ciphertext. Such constraints are dropped before a table
//! is encrypted and re-created after rollback.

use tracing::{info, warn};

use super::MigrationError;
use crate::store::{plaintext_foreign_keys, ForeignKey, RecordStore, Table};

/// Outcome of re-creating foreign keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintRepair {
    /// Constraints created by this call.
    pub created: Vec<String>,
    /// Constraints already present.
    pub present: Vec<String>,
    /// Constraints that could not be created, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ConstraintRepair {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drop every declared foreign key that touches an encrypted column and has
/// `table` at either end. Returns the dropped constraints.
///
/// # Errors
///
/// Store errors; constraints dropped before the error stay dropped.
pub async fn drop_plaintext_foreign_keys(
    store: &dyn RecordStore,
    table: Table,
) -> Result<Vec<ForeignKey>, MigrationError> {
    let mut dropped = Vec::new();
    for owner in Table::ALL {
        for fk in store.foreign_keys(owner).await? {
            let involved = fk.table == table || fk.references == table;
            if !involved || !fk.touches_encrypted_column() {
                continue;
            }
            if store.drop_foreign_key(fk.table, &fk.name).await? {
                if let Some(index) = &fk.index {
                    info!(table = %fk.table, index = %index, "dependent index dropped");
                }
                dropped.push(fk);
            }
        }
    }
    Ok(dropped)
}

/// Re-create every catalogued plaintext foreign key that is missing.
///
/// Each constraint is attempted independently; one that existing rows violate
/// is reported in [`ConstraintRepair::failed`] and the rest still proceed.
pub async fn restore_plaintext_foreign_keys(store: &dyn RecordStore) -> ConstraintRepair {
    let mut repair = ConstraintRepair::default();
    for fk in plaintext_foreign_keys() {
        let label = format!("{}.{}", fk.table, fk.name);
        match store.add_foreign_key(fk).await {
            Ok(true) => repair.created.push(label),
            Ok(false) => repair.present.push(label),
            Err(e) => {
                warn!(constraint = %label, error = %e, "foreign key could not be re-created");
                repair.failed.push((label, e.to_string()));
            }
        }
    }
    repair
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn migrating_user_drops_every_reference_to_user_email() {
        let store = MemoryStore::with_plaintext_foreign_keys();
        let dropped = drop_plaintext_foreign_keys(&store, Table::User).await.unwrap();
        assert_eq!(dropped.len(), 5);
        for t in Table::ALL {
            assert!(store.foreign_keys(t).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn migrating_feedback_drops_only_its_own_constraints() {
        let store = MemoryStore::with_plaintext_foreign_keys();
        let dropped = drop_plaintext_foreign_keys(&store, Table::Feedback).await.unwrap();
        let names: Vec<_> = dropped.iter().map(|fk| fk.name.as_str()).collect();
        assert_eq!(names, ["fk_student_email", "fk_marker_email"]);
        assert_eq!(store.foreign_keys(Table::Log).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let store = MemoryStore::new();
        let first = restore_plaintext_foreign_keys(&store).await;
        assert_eq!(first.created.len(), 5);
        assert!(first.is_success());

        let second = restore_plaintext_foreign_keys(&store).await;
        assert!(second.created.is_empty());
        assert_eq!(second.present.len(), 5);
    }
}
