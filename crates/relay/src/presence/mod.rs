// Heartbeat presence: last-seen timestamps and the derived online flag.
//
// Independent of the WebSocket registry. A user polling over plain HTTP is
// online without a live channel, and a freshly reconnected channel may exist
// before the next heartbeat lands.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool, PoolConfig},
};
use crate::hub::Identity;

/// A heartbeat keeps a user online for this long.
pub const ONLINE_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub user_id: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_online: bool,
}

/// Online iff a heartbeat was seen less than [`ONLINE_WINDOW_SECS`] before `now`.
pub fn is_online_at(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_seen.is_some_and(|seen| now - seen < Duration::seconds(ONLINE_WINDOW_SECS))
}

#[derive(Clone)]
pub enum PresenceStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<Identity, DateTime<Utc>>>>),
}

impl PresenceStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn connect(database_url: &str, pool_config: PoolConfig) -> anyhow::Result<Self> {
        let pool = create_pg_pool(database_url, pool_config)
            .await
            .context("failed to initialize relay PostgreSQL pool for presence")?;
        check_pool_health(&pool)
            .await
            .context("relay PostgreSQL health check failed for presence")?;
        run_migrations(&pool).await?;

        Ok(Self::Postgres(pool))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    /// Record a heartbeat for `identity` and return the stored timestamp.
    pub async fn touch(&self, identity: &str) -> anyhow::Result<DateTime<Utc>> {
        self.touch_at(identity, Utc::now()).await
    }

    pub(crate) async fn touch_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, DateTime<Utc>>(
                r#"
                INSERT INTO user_presence (user_id, last_seen)
                VALUES ($1, $2)
                ON CONFLICT (user_id) DO UPDATE
                    SET last_seen = EXCLUDED.last_seen
                RETURNING last_seen
                "#,
            )
            .bind(identity)
            .bind(now)
            .fetch_one(pool)
            .await
            .context("failed to upsert presence heartbeat"),
            Self::Memory(store) => {
                store.write().await.insert(identity.to_owned(), now);
                Ok(now)
            }
        }
    }

    pub async fn last_seen(&self, identity: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, DateTime<Utc>>(
                "SELECT last_seen FROM user_presence WHERE user_id = $1",
            )
            .bind(identity)
            .fetch_optional(pool)
            .await
            .context("failed to query presence"),
            Self::Memory(store) => Ok(store.read().await.get(identity).copied()),
        }
    }

    pub async fn status(&self, identity: &str) -> anyhow::Result<PresenceStatus> {
        self.status_at(identity, Utc::now()).await
    }

    pub(crate) async fn status_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PresenceStatus> {
        let last_seen = self.last_seen(identity).await?;
        Ok(PresenceStatus {
            user_id: identity.to_owned(),
            last_seen,
            is_online: is_online_at(last_seen, now),
        })
    }

    pub async fn is_online(&self, identity: &str) -> anyhow::Result<bool> {
        Ok(self.status(identity).await?.is_online)
    }
}
