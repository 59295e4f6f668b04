//! End-to-end behaviour of the cipher, lookup and migration jobs against the
//! in-memory store.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde_json::{json, Value};

use fieldcrypt::lookup::{find_all_by_encrypted_field, find_by_encrypted_field};
use fieldcrypt::migration::{Migrator, DEFAULT_SAMPLE_SIZE};
use fieldcrypt::{
    Decryption, EncryptionKey, FieldCipher, KeyRing, Lookup, MemoryStore, Record, RecordStore,
    Table,
};

fn cipher_with(key: &EncryptionKey) -> Arc<FieldCipher> {
    Arc::new(FieldCipher::new(KeyRing::new(key.clone(), None)))
}

fn rec(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

async fn insert_users(store: &MemoryStore, emails: &[&str]) {
    for email in emails {
        store
            .insert(Table::User, rec(json!({ "email": email, "firstName": "Test" })))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn encrypted_row_survives_two_migrations_and_is_found_by_email() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let cipher = cipher_with(&key);
    let store = Arc::new(MemoryStore::new());

    let stored = cipher.encrypt_str("alice@uni.edu").unwrap();
    let alice = store
        .insert(Table::User, rec(json!({ "email": stored, "firstName": "Alice" })))
        .await
        .unwrap();
    insert_users(&store, &["bob@uni.edu", "carol@uni.edu"]).await;

    let migrator = Migrator::new(store.clone(), cipher.clone(), dir.path());
    migrator.create_backup().await.unwrap();

    let first = migrator.migrate_table(Table::User).await.unwrap();
    assert!(first.is_success());
    let after_first = store.rows(Table::User).await.unwrap();

    let second = migrator.migrate_table(Table::User).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.fields_changed, 0);
    let after_second = store.rows(Table::User).await.unwrap();
    assert_eq!(after_first, after_second);

    // The pre-encrypted value was never double-encrypted.
    let row = store.get(Table::User, alice.id).await.unwrap().unwrap();
    assert_eq!(row.str_field("email"), Some(stored.as_str()));

    let lookup = Lookup::new(Table::User, "email", "alice@uni.edu");
    let found = find_all_by_encrypted_field(store.as_ref(), &cipher, &lookup)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, alice.id);
}

#[tokio::test]
async fn rollback_of_encrypted_table_leaves_only_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let cipher = cipher_with(&EncryptionKey::generate());
    let store = Arc::new(MemoryStore::with_plaintext_foreign_keys());
    insert_users(&store, &["a@uni.edu", "b@uni.edu", "c@uni.edu"]).await;
    store
        .insert(Table::Enrollment, rec(json!({ "userEmail": "a@uni.edu", "unitId": 1 })))
        .await
        .unwrap();

    let migrator = Migrator::new(store.clone(), cipher.clone(), dir.path());
    assert!(migrator.migrate_all().await.unwrap().is_success());
    assert!(migrator
        .verify_migration(DEFAULT_SAMPLE_SIZE)
        .await
        .unwrap()
        .is_success());

    let rollback = migrator.rollback_to_plaintext().await.unwrap();
    assert!(rollback.is_success(), "{rollback:?}");

    for table in Table::ENCRYPTED {
        for row in store.rows(table).await.unwrap() {
            for column in table.encrypted_columns() {
                if let Some(value) = row.str_field(column) {
                    assert!(!cipher.is_encrypted(value), "{table}.{column} row {}", row.id);
                }
            }
        }
    }
    assert!(migrator
        .verify_rollback(DEFAULT_SAMPLE_SIZE)
        .await
        .unwrap()
        .is_success());
    assert_eq!(store.foreign_keys(Table::Enrollment).await.unwrap().len(), 1);
}

#[tokio::test]
async fn corrupted_ciphertext_is_returned_unchanged() {
    let cipher = cipher_with(&EncryptionKey::generate());
    let ct = cipher.encrypt_str("dave@uni.edu").unwrap();

    let mut bytes = URL_SAFE.decode(&ct).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let corrupted = URL_SAFE.encode(&bytes);

    assert_eq!(cipher.decrypt(Some(&corrupted)).as_deref(), Some(corrupted.as_str()));
    assert!(matches!(
        cipher.decrypt_tagged(&corrupted),
        Decryption::Corrupt { .. }
    ));
}

#[tokio::test]
async fn lookup_finds_one_none_or_any_duplicate() {
    let cipher = cipher_with(&EncryptionKey::generate());
    let store = MemoryStore::new();
    for email in ["a@uni.edu", "target@uni.edu", "b@uni.edu", "dup@uni.edu", "dup@uni.edu"] {
        store
            .insert(
                Table::User,
                rec(json!({ "email": cipher.encrypt_str(email).unwrap() })),
            )
            .await
            .unwrap();
    }

    let one = Lookup::new(Table::User, "email", "target@uni.edu");
    let row = find_by_encrypted_field(&store, &cipher, &one).await.unwrap().unwrap();
    assert_eq!(
        cipher.decrypt(row.str_field("email")).as_deref(),
        Some("target@uni.edu")
    );

    let none = Lookup::new(Table::User, "email", "nobody@uni.edu");
    assert!(find_by_encrypted_field(&store, &cipher, &none).await.unwrap().is_none());

    let dup = Lookup::new(Table::User, "email", "dup@uni.edu");
    let found = find_by_encrypted_field(&store, &cipher, &dup).await.unwrap().unwrap();
    let all = find_all_by_encrypted_field(&store, &cipher, &dup).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|r| r.id == found.id));
}

#[tokio::test]
async fn rotated_key_still_finds_rows_migrated_under_the_old_key() {
    let dir = tempfile::tempdir().unwrap();
    let old = EncryptionKey::generate();
    let store = Arc::new(MemoryStore::new());
    insert_users(&store, &["erin@uni.edu"]).await;

    Migrator::new(store.clone(), cipher_with(&old), dir.path())
        .migrate_all()
        .await
        .unwrap();

    let rotated = FieldCipher::new(KeyRing::new(EncryptionKey::generate(), Some(old)));
    let lookup = Lookup::new(Table::User, "email", "erin@uni.edu");
    let row = find_by_encrypted_field(store.as_ref(), &rotated, &lookup)
        .await
        .unwrap()
        .unwrap();

    let stored = row.str_field("email").unwrap();
    let fresh = rotated.reencrypt(stored).unwrap().unwrap();
    assert_eq!(rotated.decrypt(Some(&fresh)).as_deref(), Some("erin@uni.edu"));
}
