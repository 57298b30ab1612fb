use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    ConnectOptions, Row,
};
use tracing::debug;

use crate::storage::{Collection, Storage};

/// records persisted to sqlite, one `records` table shared by every collection
#[derive(Debug, Clone)]
pub struct SqliteStore {
    inner: SqlitePool,
}

impl SqliteStore {
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, sqlx::Error> {
        let uri = uri.as_ref();
        let mut opts = SqliteConnectOptions::from_str(uri)?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);

        // in memory sqlite is per connection, keep exactly one alive
        let inner = if uri.contains("memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePool::connect_with(opts).await?
        };
        sqlx::migrate!("../../migrations").run(&inner).await?;
        debug!(?uri, "opened record store");
        Ok(Self { inner })
    }
}

#[async_trait]
impl Storage for SqliteStore {
    type Error = sqlx::Error;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, Self::Error> {
        sqlx::query("SELECT value FROM records WHERE collection = ?1 AND key = ?2")
            .bind(collection.as_str())
            .bind(key)
            .fetch_optional(&self.inner)
            .await?
            .map(|row| row.try_get("value"))
            .transpose()
    }

    async fn get_or_insert(
        &self,
        collection: Collection,
        key: &str,
        value: String,
    ) -> Result<(String, bool), Self::Error> {
        // TRANSACTION START
        let mut trans = self.inner.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO records (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (collection, key) DO NOTHING",
        )
        .bind(collection.as_str())
        .bind(key)
        .bind(&value)
        .bind(Utc::now().timestamp())
        .execute(&mut trans)
        .await?
        .rows_affected()
            == 1;
        let stored: String =
            sqlx::query("SELECT value FROM records WHERE collection = ?1 AND key = ?2")
                .bind(collection.as_str())
                .bind(key)
                .fetch_one(&mut trans)
                .await?
                .try_get("value")?;
        // TRANSACTION COMMIT
        trans.commit().await?;
        Ok((stored, inserted))
    }

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        value: String,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            "INSERT INTO records (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (collection, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(collection.as_str())
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, Self::Error> {
        Ok(
            sqlx::query("DELETE FROM records WHERE collection = ?1 AND key = ?2")
                .bind(collection.as_str())
                .bind(key)
                .execute(&self.inner)
                .await?
                .rows_affected()
                > 0,
        )
    }

    async fn select_all(&self, collection: Collection) -> Result<Vec<(String, String)>, Self::Error> {
        sqlx::query("SELECT key, value FROM records WHERE collection = ?1 ORDER BY key")
            .bind(collection.as_str())
            .fetch_all(&self.inner)
            .await?
            .into_iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }
}
