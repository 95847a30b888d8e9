//! Node-scoped access tokens.
//!
//! Tokens are opaque bearer strings handed out exactly once at issue
//! time; only a sha256 hash is kept at rest. Revocation is immediate.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use wiregate_common::{AccessToken, Database, Error, Result};

/// Issues, verifies and revokes node access tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    db: Database,
}

/// Freshly issued token: the stored record plus the one-time plaintext.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub record: AccessToken,
    pub token: String,
}

impl TokenIssuer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a new named token bound to a node.
    pub fn issue(&self, node_id: Uuid, name: &str) -> Result<IssuedToken> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let token_hash = hash_token(&token);

        let id = Uuid::new_v4();
        let now = wiregate_common::now_epoch_secs();

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO access_tokens (id, node_id, name, token_hash, created_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![id.to_string(), node_id.to_string(), name, token_hash, now],
        )?;

        Ok(IssuedToken {
            record: AccessToken {
                id,
                node_id,
                name: name.to_string(),
                token_hash,
                created_at: now,
                revoked_at: None,
            },
            token,
        })
    }

    /// Resolve a plaintext token to its record, if valid and unrevoked.
    pub fn verify(&self, token: &str) -> Result<Option<AccessToken>> {
        let token_hash = hash_token(token);
        let conn = self.db.connection();
        let conn = conn.lock();
        let record = conn
            .query_row(
                "SELECT id, node_id, name, token_hash, created_at, revoked_at
                 FROM access_tokens WHERE token_hash = ?1",
                params![token_hash],
                row_to_token,
            )
            .optional()?;
        Ok(record.filter(|t| !t.is_revoked()))
    }

    pub fn list(&self, node_id: Uuid) -> Result<Vec<AccessToken>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, name, token_hash, created_at, revoked_at
             FROM access_tokens WHERE node_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![node_id.to_string()], row_to_token)?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    /// Revoke a single token by id.
    pub fn revoke(&self, token_id: Uuid) -> Result<()> {
        let now = wiregate_common::now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE access_tokens SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![now, token_id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("token", token_id));
        }
        Ok(())
    }

    /// Revoke every token issued to a node.
    pub fn revoke_all(&self, node_id: Uuid) -> Result<usize> {
        let now = wiregate_common::now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        let changed = conn.execute(
            "UPDATE access_tokens SET revoked_at = ?1 WHERE node_id = ?2 AND revoked_at IS NULL",
            params![now, node_id.to_string()],
        )?;
        Ok(changed)
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_token(row: &Row) -> rusqlite::Result<AccessToken> {
    let id: String = row.get(0)?;
    let node_id: String = row.get(1)?;
    Ok(AccessToken {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        node_id: Uuid::parse_str(&node_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get(2)?,
        token_hash: row.get(3)?,
        created_at: row.get(4)?,
        revoked_at: row.get(5)?,
    })
}
