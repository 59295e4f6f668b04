//! Table catalogue: which tables exist, which of their columns hold PII, and
//! which foreign keys assume plaintext equality.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Every table the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Table {
    User,
    Feedback,
    FeedbackRequest,
    Log,
    Enrollment,
    Highlight,
    Action,
    Unit,
    Assessment,
}

impl Table {
    /// All tables.
    pub const ALL: [Table; 9] = [
        Table::User,
        Table::Feedback,
        Table::FeedbackRequest,
        Table::Log,
        Table::Enrollment,
        Table::Highlight,
        Table::Action,
        Table::Unit,
        Table::Assessment,
    ];

    /// Tables with at least one encrypted column, in migration order.
    pub const ENCRYPTED: [Table; 5] = [
        Table::User,
        Table::Feedback,
        Table::Log,
        Table::FeedbackRequest,
        Table::Enrollment,
    ];

    /// The SQL name of the table.
    pub fn sql_name(self) -> &'static str {
        match self {
            Table::User => "USER",
            Table::Feedback => "FEEDBACK",
            Table::FeedbackRequest => "FEEDBACK_REQUEST",
            Table::Log => "LOG",
            Table::Enrollment => "ENROLLMENT",
            Table::Highlight => "HIGHLIGHT",
            Table::Action => "ACTION",
            Table::Unit => "UNIT",
            Table::Assessment => "ASSESSMENT",
        }
    }

    /// Columns that hold ciphertext once the table is migrated.
    pub fn encrypted_columns(self) -> &'static [&'static str] {
        match self {
            Table::User => &["email", "firstName", "lastName", "monashId", "monashObjectId"],
            Table::Feedback => &["studentEmail", "markerEmail"],
            Table::Log => &["userEmail"],
            Table::FeedbackRequest => &["student_id"],
            Table::Enrollment => &["userEmail"],
            Table::Highlight | Table::Action | Table::Unit | Table::Assessment => &[],
        }
    }

    /// `true` if the table has any encrypted column.
    pub fn is_encrypted(self) -> bool {
        !self.encrypted_columns().is_empty()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// Returned by [`Table::from_str`] for an unknown name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown table: {0}")]
pub struct UnknownTable(pub String);

impl FromStr for Table {
    type Err = UnknownTable;

    /// Case-insensitive; `-` and `_` are interchangeable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Table::ALL
            .into_iter()
            .find(|t| t.sql_name() == wanted)
            .ok_or_else(|| UnknownTable(s.to_owned()))
    }
}

/// A foreign-key constraint between two columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name, unique within `table`.
    pub name: String,
    /// Referencing table.
    pub table: Table,
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub references: Table,
    /// Referenced column.
    pub referenced_column: String,
    /// Index that exists only to back this constraint and is dropped with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl ForeignKey {
    fn to_user_email(name: &str, table: Table, column: &str, index: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            table,
            column: column.to_owned(),
            references: Table::User,
            referenced_column: "email".to_owned(),
            index: index.map(str::to_owned),
        }
    }

    /// `true` if either end of the constraint is an encrypted column.
    pub fn touches_encrypted_column(&self) -> bool {
        self.table.encrypted_columns().contains(&self.column.as_str())
            || self
                .references
                .encrypted_columns()
                .contains(&self.referenced_column.as_str())
    }
}

/// Foreign keys of the pre-encryption schema that join on plaintext email.
///
/// They cannot hold once either side is encrypted with a random nonce, so the
/// forward migration drops them and rollback re-creates them.
pub fn plaintext_foreign_keys() -> Vec<ForeignKey> {
    vec![
        ForeignKey::to_user_email("fk_student_email", Table::Feedback, "studentEmail", None),
        ForeignKey::to_user_email("fk_marker_email", Table::Feedback, "markerEmail", None),
        ForeignKey::to_user_email("userEmail", Table::Log, "userEmail", Some("userEmail_idx")),
        ForeignKey::to_user_email("enrollment_ibfk_1", Table::Enrollment, "userEmail", None),
        ForeignKey::to_user_email(
            "feedback_request_ibfk_1",
            Table::FeedbackRequest,
            "student_id",
            None,
        ),
    ]
}
