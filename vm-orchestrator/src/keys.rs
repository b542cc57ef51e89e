use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// An account-level SSH public key, merged into every VM the owner provisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

const KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Minimal shape check: `<type> <base64> [comment]` on a single line.
pub fn validate_public_key(key: &str) -> Result<()> {
    let key = key.trim();
    if key.contains('\n') {
        return Err(OrchestratorError::InvalidInput(
            "SSH key must be a single line".to_string(),
        ));
    }
    let mut parts = key.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    if !KEY_TYPES.contains(&kind) || body.is_empty() {
        return Err(OrchestratorError::InvalidInput(format!(
            "Unsupported SSH key format: {}",
            kind
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct SshKeyStore {
    pool: SqlitePool,
}

impl SshKeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add(&self, owner: &str, name: &str, public_key: &str) -> Result<SshKey> {
        validate_public_key(public_key)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        let inserted = sqlx::query(
            "INSERT INTO ssh_keys (id, owner, name, public_key, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(owner)
        .bind(name)
        .bind(public_key.trim())
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(err) = inserted {
            if err
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                return Err(OrchestratorError::InvalidInput(
                    "SSH key already registered".to_string(),
                ));
            }
            return Err(err.into());
        }

        Ok(SshKey {
            id,
            owner: owner.to_string(),
            name: name.to_string(),
            public_key: public_key.trim().to_string(),
            created_at: DateTime::from_timestamp(now, 0).unwrap_or_default(),
        })
    }

    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<SshKey>> {
        let rows = sqlx::query_as::<_, SshKeyRow>(
            "SELECT * FROM ssh_keys WHERE owner = ? ORDER BY created_at, rowid",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SshKey::from).collect())
    }

    pub async fn delete(&self, owner: &str, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM ssh_keys WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("SSH key {id}")));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SshKeyRow {
    id: String,
    owner: String,
    name: String,
    public_key: String,
    created_at: i64,
}

impl From<SshKeyRow> for SshKey {
    fn from(row: SshKeyRow) -> Self {
        Self {
            id: row.id,
            owner: row.owner,
            name: row.name,
            public_key: row.public_key,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB8m alice@laptop";

    #[test]
    fn test_validate_public_key() {
        assert!(validate_public_key(KEY).is_ok());
        assert!(validate_public_key("ssh-rsa").is_err());
        assert!(validate_public_key("not-a-key AAAA").is_err());
        assert!(validate_public_key("ssh-rsa AAAA\nssh-rsa BBBB").is_err());
    }

    #[tokio::test]
    async fn test_keys_are_scoped_to_owner() {
        let store = SshKeyStore::new(create_test_db().await);
        let key = store.add("alice", "laptop", KEY).await.unwrap();
        store
            .add("bob", "desktop", "ssh-rsa AAAAB3NzaC1yc2E bob")
            .await
            .unwrap();

        let alice = store.list_for_owner("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].public_key, KEY);

        let err = store.add("alice", "again", KEY).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        assert!(store.delete("bob", &key.id).await.is_err());
        store.delete("alice", &key.id).await.unwrap();
        assert!(store.list_for_owner("alice").await.unwrap().is_empty());
    }
}
