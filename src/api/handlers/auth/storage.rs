//! Postgres-backed identity and magic token storage.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    roles::Role,
    store::{
        with_retry, Identity, IdentityStore, MagicTokenStore, NewMagicToken, RedeemOutcome,
        StoreError,
    },
    utils::generate_security_stamp,
};

const IDENTITY_COLUMNS: &str =
    "id, external_id, display_name, role, tenant_id, security_stamp, deleted_at IS NULL AS active";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn timestamp(unix_seconds: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp(unix_seconds)
        .map_err(|err| StoreError::Query(format!("timestamp out of range: {err}")))
}

/// Decode an identity row; `None` when the row is soft-deleted.
fn identity_from_row(row: &PgRow) -> Result<Option<Identity>, StoreError> {
    let active: bool = row.try_get("active")?;
    if !active {
        return Ok(None);
    }
    let raw_role: String = row.try_get("role")?;
    let role = Role::parse(&raw_role)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown role '{raw_role}'")))?;
    Ok(Some(Identity {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        display_name: row.try_get("display_name")?,
        role,
        tenant_id: row.try_get("tenant_id")?,
        security_stamp: row.try_get("security_stamp")?,
    }))
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn find(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = with_retry("identity.find", || {
            sqlx::query(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", &query))
        })
        .await?;
        match row {
            Some(row) => identity_from_row(&row),
            None => Ok(None),
        }
    }

    async fn find_or_create_external(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Option<Identity>, StoreError> {
        // New identities start as tenant owners without a tenant; the upsert keeps
        // role, tenant and stamp of an existing row untouched.
        let query = format!(
            r"
            INSERT INTO identities (external_id, display_name, role, security_stamp)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_id) DO UPDATE
                SET display_name = COALESCE(EXCLUDED.display_name, identities.display_name),
                    updated_at = NOW()
            RETURNING {IDENTITY_COLUMNS}
            "
        );
        let stamp = generate_security_stamp()
            .map_err(|err| StoreError::Unavailable(format!("rng failure: {err}")))?;
        let row = with_retry("identity.find_or_create_external", || {
            sqlx::query(&query)
                .bind(external_id)
                .bind(display_name)
                .bind(Role::Owner.as_str())
                .bind(&stamp)
                .fetch_one(&self.pool)
                .instrument(db_span("INSERT", &query))
        })
        .await?;
        identity_from_row(&row)
    }

    async fn rotate_stamp(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let query = r"
            UPDATE identities
            SET security_stamp = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING security_stamp
        ";
        let stamp = generate_security_stamp()
            .map_err(|err| StoreError::Unavailable(format!("rng failure: {err}")))?;
        let row = with_retry("identity.rotate_stamp", || {
            sqlx::query(query)
                .bind(id)
                .bind(&stamp)
                .fetch_optional(&self.pool)
                .instrument(db_span("UPDATE", query))
        })
        .await?;
        row.map(|row| row.try_get("security_stamp").map_err(StoreError::from))
            .transpose()
    }
}

#[async_trait]
impl MagicTokenStore for PgStore {
    async fn insert(&self, token: NewMagicToken) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO magic_tokens (token_hash, identity_id, expires_at)
            VALUES ($1, $2, $3)
        ";
        let expires_at = timestamp(token.expires_at)?;
        with_retry("magic_token.insert", || {
            sqlx::query(query)
                .bind(&token.token_hash)
                .bind(token.identity_id)
                .bind(expires_at)
                .execute(&self.pool)
                .instrument(db_span("INSERT", query))
        })
        .await?;
        Ok(())
    }

    async fn redeem(&self, token_hash: &[u8], now: i64) -> Result<RedeemOutcome, StoreError> {
        // One statement burns the token and reads its owner, so two concurrent
        // redeems cannot both match `used = FALSE` and no later read can strand a
        // burned link. Tokens of disabled identities never match.
        let query = r"
            UPDATE magic_tokens AS m
            SET used = TRUE, used_at = NOW()
            FROM identities AS i
            WHERE m.token_hash = $1
              AND m.used = FALSE
              AND m.expires_at > $2
              AND i.id = m.identity_id
              AND i.deleted_at IS NULL
            RETURNING i.id, i.external_id, i.display_name, i.role, i.tenant_id,
                      i.security_stamp, TRUE AS active
        ";
        let now_ts = timestamp(now)?;
        // Only acquiring a connection is retried: the update may have committed
        // before a transport error, and a second attempt would report it used.
        let mut conn = with_retry("magic_token.acquire", || self.pool.acquire()).await?;
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(now_ts)
            .fetch_optional(&mut *conn)
            .instrument(db_span("UPDATE", query))
            .await?;
        drop(conn);
        if let Some(row) = row {
            return identity_from_row(&row)?
                .map(RedeemOutcome::Redeemed)
                .ok_or_else(|| StoreError::Corrupt("redeemed link of inactive identity".into()));
        }

        // Read-only classification of why the update matched nothing.
        let query = r"
            SELECT m.used, m.expires_at > $2 AS live,
                   COALESCE(i.deleted_at IS NULL, FALSE) AS owner_active
            FROM magic_tokens AS m
            LEFT JOIN identities AS i ON i.id = m.identity_id
            WHERE m.token_hash = $1
        ";
        let row = with_retry("magic_token.classify", || {
            sqlx::query(query)
                .bind(token_hash)
                .bind(now_ts)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
        })
        .await?;
        let Some(row) = row else {
            return Ok(RedeemOutcome::Unknown);
        };
        let used: bool = row.try_get("used")?;
        let live: bool = row.try_get("live")?;
        let owner_active: bool = row.try_get("owner_active")?;
        // Unused and live here means a concurrent request consumed it between the
        // two statements; it is never admitted twice.
        Ok(if used {
            RedeemOutcome::AlreadyUsed
        } else if !live {
            RedeemOutcome::Expired
        } else if !owner_active {
            RedeemOutcome::Unknown
        } else {
            RedeemOutcome::AlreadyUsed
        })
    }

    async fn invalidate_outstanding(&self, identity_id: Uuid) -> Result<u64, StoreError> {
        let query = "DELETE FROM magic_tokens WHERE identity_id = $1 AND used = FALSE";
        let result = with_retry("magic_token.invalidate_outstanding", || {
            sqlx::query(query)
                .bind(identity_id)
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: i64) -> Result<u64, StoreError> {
        let query = "DELETE FROM magic_tokens WHERE expires_at <= $1";
        let now_ts = timestamp(now)?;
        let result = with_retry("magic_token.purge_expired", || {
            sqlx::query(query)
                .bind(now_ts)
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
        })
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_converts_unix_seconds() {
        let ts = timestamp(1_700_000_000).map(OffsetDateTime::unix_timestamp);
        assert_eq!(ts.ok(), Some(1_700_000_000));
        assert!(timestamp(i64::MAX).is_err());
    }

    #[test]
    fn identity_columns_include_soft_delete_flag() {
        assert!(IDENTITY_COLUMNS.contains("deleted_at IS NULL AS active"));
    }
}
