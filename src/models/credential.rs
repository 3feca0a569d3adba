use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CredentialKind {
    Key,
    Password,
}

/// SSH-учётка. Секрет хранится только в зашифрованном виде и никогда
/// не попадает в ответы API или логи.
#[derive(Debug, Clone, FromRow)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub kind: CredentialKind,
    pub encrypted_secret: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
