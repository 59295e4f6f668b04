//! Equality search over encrypted columns.
//!
//! Ciphertext is randomised, so `WHERE email = ?` can never match. Every lookup
//! here fetches the candidate rows (optionally narrowed by a plaintext column),
//! decrypts the encrypted column of each and compares. Rows that fail to
//! decrypt are compared by their raw stored value, which covers rows not yet
//! migrated.
//!
//! The cost is one decryption per candidate row. Without a plaintext
//! pre-filter that is a full table scan; call sites on large tables should
//! supply one.

use serde_json::Value;
use tracing::debug;

use crate::crypto::FieldCipher;
use crate::store::{RecordStore, Row, StoreError, Table};

/// Does the stored `value` hold `target`?
///
/// Compares the decrypted plaintext when `value` decrypts, and the raw stored
/// value otherwise.
pub fn matches(cipher: &FieldCipher, value: &str, target: &str) -> bool {
    cipher.decrypt_tagged(value).as_str() == target
}

/// Does the encrypted `column` of `row` hold `plaintext`? Used for ownership
/// checks such as "does this feedback belong to the caller".
pub fn owns(cipher: &FieldCipher, row: &Row, column: &str, plaintext: &str) -> bool {
    row.str_field(column)
        .is_some_and(|stored| matches(cipher, stored, plaintext))
}

/// The first item whose encrypted field holds `target`.
///
/// Items are visited in iterator order; when several match, the first one
/// visited wins.
pub fn scan_first<T, I, F>(items: I, cipher: &FieldCipher, field: F, target: &str) -> Option<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> Option<&str>,
{
    items
        .into_iter()
        .find(|item| field(item).is_some_and(|stored| matches(cipher, stored, target)))
}

/// Every item whose encrypted field holds `target`, in iterator order.
pub fn scan_all<T, I, F>(items: I, cipher: &FieldCipher, field: F, target: &str) -> Vec<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> Option<&str>,
{
    items
        .into_iter()
        .filter(|item| field(item).is_some_and(|stored| matches(cipher, stored, target)))
        .collect()
}

/// Parameters of a lookup by encrypted column.
#[derive(Debug, Clone)]
pub struct Lookup<'a> {
    pub table: Table,
    /// The encrypted column to compare.
    pub column: &'a str,
    /// The plaintext to look for.
    pub target: &'a str,
    /// Plaintext column and value that narrow the candidate rows first.
    pub prefilter: Option<(&'a str, Value)>,
}

impl<'a> Lookup<'a> {
    pub fn new(table: Table, column: &'a str, target: &'a str) -> Self {
        Self {
            table,
            column,
            target,
            prefilter: None,
        }
    }

    /// Only consider rows whose plaintext `column` equals `value`.
    pub fn prefilter(mut self, column: &'a str, value: impl Into<Value>) -> Self {
        self.prefilter = Some((column, value.into()));
        self
    }

    async fn candidates(&self, store: &dyn RecordStore) -> Result<Vec<Row>, StoreError> {
        let rows = match &self.prefilter {
            Some((column, value)) => store.rows_where(self.table, column, value).await?,
            None => store.rows(self.table).await?,
        };
        debug!(
            table = %self.table,
            column = self.column,
            candidates = rows.len(),
            prefiltered = self.prefilter.is_some(),
            "scanning encrypted column"
        );
        Ok(rows)
    }
}

/// The first row matched by `lookup`, or `None`.
///
/// # Errors
///
/// Propagates store errors. Decryption failures are not errors.
pub async fn find_by_encrypted_field(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    lookup: &Lookup<'_>,
) -> Result<Option<Row>, StoreError> {
    let rows = lookup.candidates(store).await?;
    Ok(scan_first(
        rows,
        cipher,
        |row| row.str_field(lookup.column),
        lookup.target,
    ))
}

/// Every row matched by `lookup`.
///
/// # Errors
///
/// Propagates store errors. Decryption failures are not errors.
pub async fn find_all_by_encrypted_field(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    lookup: &Lookup<'_>,
) -> Result<Vec<Row>, StoreError> {
    let rows = lookup.candidates(store).await?;
    Ok(scan_all(
        rows,
        cipher,
        |row| row.str_field(lookup.column),
        lookup.target,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{EncryptionKey, KeyRing};
    use crate::store::MemoryStore;
    use crate::Record;
    use serde_json::json;

    fn cipher() -> FieldCipher {
        FieldCipher::new(KeyRing::new(EncryptionKey::generate(), None))
    }

    fn rec(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn scan_first_finds_the_single_match() {
        let c = cipher();
        let emails: Vec<String> = ["a@uni.edu", "b@uni.edu", "c@uni.edu"]
            .iter()
            .map(|e| c.encrypt_str(e).unwrap())
            .collect();
        let found = scan_first(emails.iter(), &c, |s| Some(s.as_str()), "b@uni.edu");
        assert_eq!(found, Some(&emails[1]));
        assert_eq!(scan_first(emails.iter(), &c, |s| Some(s.as_str()), "z@uni.edu"), None);
    }

    #[test]
    fn scan_falls_back_to_raw_value_for_legacy_rows() {
        let c = cipher();
        let rows = vec![c.encrypt_str("a@uni.edu").unwrap(), "legacy@uni.edu".to_owned()];
        assert!(scan_first(&rows, &c, |s| Some(s.as_str()), "legacy@uni.edu").is_some());
    }

    #[test]
    fn scan_all_returns_every_duplicate() {
        let c = cipher();
        let rows: Vec<String> = (0..3).map(|_| c.encrypt_str("dup@uni.edu").unwrap()).collect();
        assert_eq!(scan_all(&rows, &c, |s| Some(s.as_str()), "dup@uni.edu").len(), 3);
        assert!(scan_first(&rows, &c, |s| Some(s.as_str()), "dup@uni.edu").is_some());
    }

    #[test]
    fn owns_compares_decrypted_column() {
        let c = cipher();
        let row = Row {
            id: 7,
            record: rec(json!({ "studentEmail": c.encrypt_str("s@uni.edu").unwrap() })),
        };
        assert!(owns(&c, &row, "studentEmail", "s@uni.edu"));
        assert!(!owns(&c, &row, "studentEmail", "t@uni.edu"));
        assert!(!owns(&c, &row, "markerEmail", "s@uni.edu"));
    }

    #[tokio::test]
    async fn find_with_prefilter_only_considers_filtered_rows() {
        let c = cipher();
        let store = MemoryStore::new();
        for assignment in [1, 2] {
            store
                .insert(
                    Table::FeedbackRequest,
                    rec(json!({
                        "assignmentId": assignment,
                        "student_id": c.encrypt_str("s@uni.edu").unwrap(),
                    })),
                )
                .await
                .unwrap();
        }

        let lookup =
            Lookup::new(Table::FeedbackRequest, "student_id", "s@uni.edu").prefilter("assignmentId", 2);
        let row = find_by_encrypted_field(&store, &c, &lookup).await.unwrap().unwrap();
        assert_eq!(row.record["assignmentId"], json!(2));

        let all = Lookup::new(Table::FeedbackRequest, "student_id", "s@uni.edu");
        assert_eq!(find_all_by_encrypted_field(&store, &c, &all).await.unwrap().len(), 2);

        let none = Lookup::new(Table::FeedbackRequest, "student_id", "x@uni.edu");
        assert!(find_by_encrypted_field(&store, &c, &none).await.unwrap().is_none());
    }
}
