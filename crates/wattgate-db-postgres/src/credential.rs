//! Shared credential rows.

use chrono::{DateTime, Utc};
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use tracing::instrument;
use wattgate_core::{Credential, NewCredential, SHARED_HOLDER, StorageError, StorageResult};

use crate::error::from_sqlx;

type CredentialRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn from_row(row: CredentialRow) -> Credential {
    let (scope, holder, access_token, token_type, granted_scope, expires_at, created_at, updated_at) =
        row;
    Credential {
        scope,
        holder,
        access_token,
        token_type,
        granted_scope,
        expires_at,
        created_at,
        updated_at,
    }
}

/// Credential queries bound to a borrowed pool.
pub struct CredentialStore<'a> {
    pool: &'a PgPool,
}

impl<'a> CredentialStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn find(&self, scope: &str) -> StorageResult<Option<Credential>> {
        let row: Option<CredentialRow> = query_as(
            r#"
            SELECT scope, holder, access_token, token_type, granted_scope,
                   expires_at, created_at, updated_at
            FROM shared_credential
            WHERE scope = $1 AND holder = $2
            "#,
        )
        .bind(scope)
        .bind(SHARED_HOLDER)
        .fetch_optional(self.pool)
        .await
        .map_err(from_sqlx)?;

        Ok(row.map(from_row))
    }

    /// Inserts the row, reporting a primary-key collision as `AlreadyExists`.
    #[instrument(skip(self, credential), fields(scope = %credential.scope))]
    pub async fn insert(&self, credential: &NewCredential) -> StorageResult<Credential> {
        let row: CredentialRow = query_as(
            r#"
            INSERT INTO shared_credential
                (scope, holder, access_token, token_type, granted_scope, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            RETURNING scope, holder, access_token, token_type, granted_scope,
                      expires_at, created_at, updated_at
            "#,
        )
        .bind(&credential.scope)
        .bind(SHARED_HOLDER)
        .bind(&credential.access_token)
        .bind(&credential.token_type)
        .bind(&credential.granted_scope)
        .bind(credential.expires_at)
        .fetch_one(self.pool)
        .await
        .map_err(|e| {
            if let sqlx_core::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StorageError::already_exists("credential", credential.scope.clone());
            }
            from_sqlx(e)
        })?;

        Ok(from_row(row))
    }

    /// Overwrites every mutable column when the stored expiry still matches.
    #[instrument(skip(self, credential), fields(scope = %credential.scope))]
    pub async fn replace(
        &self,
        expected_expires_at: DateTime<Utc>,
        credential: &NewCredential,
    ) -> StorageResult<Option<Credential>> {
        let row: Option<CredentialRow> = query_as(
            r#"
            UPDATE shared_credential
            SET access_token = $4,
                token_type = $5,
                granted_scope = $6,
                expires_at = $7,
                updated_at = NOW()
            WHERE scope = $1 AND holder = $2 AND expires_at = $3
            RETURNING scope, holder, access_token, token_type, granted_scope,
                      expires_at, created_at, updated_at
            "#,
        )
        .bind(&credential.scope)
        .bind(SHARED_HOLDER)
        .bind(expected_expires_at)
        .bind(&credential.access_token)
        .bind(&credential.token_type)
        .bind(&credential.granted_scope)
        .bind(credential.expires_at)
        .fetch_optional(self.pool)
        .await
        .map_err(from_sqlx)?;

        Ok(row.map(from_row))
    }
}
