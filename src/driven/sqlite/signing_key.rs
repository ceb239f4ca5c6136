use std::sync::Arc;

use sqlx::{sqlite::SqliteRow, Executor, FromRow, QueryBuilder, Row, Sqlite, Transaction};
use tokio::sync::Mutex;

use crate::domain::{
    error::Error,
    signing_key::{
        AsymSigningKey, AsymSigningKeyFilter, SigningKeyDrivenStorage, SigningKeyDrivenTx,
    },
    Result,
};

use super::SqliteState;

const SELECT_KEYS: &str = r#"
    SELECT
        ask.id,
        ask.status,
        ask.plugin_type,
        ask.pub_key_id,
        ask.public_key,
        ask.plugin_data,
        ask.version,
        ask.created_at,
        ask.updated_at
    FROM asym_signing_key ask
    WHERE 1 = 1
"#;

async fn insert<'e, E>(executor: E, key: &AsymSigningKey) -> Result<AsymSigningKey>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
            INSERT INTO asym_signing_key (
                id,
                status,
                plugin_type,
                pub_key_id,
                public_key,
                plugin_data,
                version,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8);
        "#,
    )
    .bind(&key.id)
    .bind(key.status.to_string())
    .bind(&key.plugin_type)
    .bind(&key.pub_key_id)
    .bind(&key.public_key)
    .bind(&key.plugin_data)
    .bind(key.created_at)
    .bind(key.updated_at)
    .execute(executor)
    .await?;

    Ok(AsymSigningKey {
        version: 1,
        ..key.clone()
    })
}

async fn update<'e, E>(executor: E, key: &AsymSigningKey) -> Result<AsymSigningKey>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
            UPDATE asym_signing_key
            SET
                status = $1,
                public_key = $2,
                plugin_data = $3,
                updated_at = $4,
                version = version + 1
            WHERE id = $5 AND version = $6;
        "#,
    )
    .bind(key.status.to_string())
    .bind(&key.public_key)
    .bind(&key.plugin_data)
    .bind(key.updated_at)
    .bind(&key.id)
    .bind(key.version)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "signing key {} changed since version {}",
            key.id, key.version
        )));
    }

    Ok(AsymSigningKey {
        version: key.version + 1,
        ..key.clone()
    })
}

async fn delete<'e, E>(executor: E, key: &AsymSigningKey) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
            DELETE FROM asym_signing_key
            WHERE id = $1 AND version = $2;
        "#,
    )
    .bind(&key.id)
    .bind(key.version)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "signing key {} changed since version {}",
            key.id, key.version
        )));
    }

    Ok(())
}

pub struct SqliteSigningKeyDrivenStorage {
    sqlite: Arc<SqliteState>,
}
impl SqliteSigningKeyDrivenStorage {
    pub fn new(sqlite: Arc<SqliteState>) -> Self {
        Self { sqlite }
    }
}
#[async_trait::async_trait]
impl SigningKeyDrivenStorage for SqliteSigningKeyDrivenStorage {
    async fn find(&self, filter: &AsymSigningKeyFilter) -> Result<Vec<AsymSigningKey>> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_KEYS);

        if !filter.status.is_empty() {
            query.push(" AND ask.status IN (");
            let mut separated = query.separated(", ");
            for status in &filter.status {
                separated.push_bind(status.to_string());
            }
            separated.push_unseparated(")");
        }

        if filter.public_key_not_empty {
            query.push(" AND ask.public_key IS NOT NULL AND length(ask.public_key) > 0");
        }

        query.push(" ORDER BY ask.created_at ASC;");

        let keys = query
            .build_query_as::<AsymSigningKey>()
            .fetch_all(&self.sqlite.db)
            .await?;

        Ok(keys)
    }

    async fn create(&self, key: &AsymSigningKey) -> Result<AsymSigningKey> {
        insert(&self.sqlite.db, key).await
    }

    async fn update(&self, key: &AsymSigningKey) -> Result<AsymSigningKey> {
        update(&self.sqlite.db, key).await
    }

    async fn delete(&self, key: &AsymSigningKey) -> Result<()> {
        delete(&self.sqlite.db, key).await
    }

    async fn begin(&self) -> Result<Box<dyn SigningKeyDrivenTx>> {
        let tx = self.sqlite.db.begin().await?;
        Ok(Box::new(SqliteSigningKeyDrivenTx {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

pub struct SqliteSigningKeyDrivenTx {
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
}
impl SqliteSigningKeyDrivenTx {
    fn closed() -> Error {
        Error::Unexpected("signing key transaction already closed".into())
    }
}
#[async_trait::async_trait]
impl SigningKeyDrivenTx for SqliteSigningKeyDrivenTx {
    async fn create(&self, key: &AsymSigningKey) -> Result<AsymSigningKey> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        insert(&mut **tx, key).await
    }

    async fn update(&self, key: &AsymSigningKey) -> Result<AsymSigningKey> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        update(&mut **tx, key).await
    }

    async fn delete(&self, key: &AsymSigningKey) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::closed)?;
        delete(&mut **tx, key).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self.tx.into_inner().ok_or_else(Self::closed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let tx = self.tx.into_inner().ok_or_else(Self::closed)?;
        tx.rollback().await?;
        Ok(())
    }
}

impl FromRow<'_, SqliteRow> for AsymSigningKey {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: &str = row.try_get("status")?;

        Ok(Self {
            id: row.try_get("id")?,
            status: status
                .parse()
                .map_err(|err: Error| sqlx::Error::Decode(err.into()))?,
            plugin_type: row.try_get("plugin_type")?,
            pub_key_id: row.try_get("pub_key_id")?,
            public_key: row.try_get("public_key")?,
            plugin_data: row.try_get("plugin_data")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};

    use crate::domain::signing_key::AsymSigningKeyStatus;

    use super::*;

    async fn get_storage() -> SqliteSigningKeyDrivenStorage {
        let sqlite = Arc::new(SqliteState::ephemeral().await.unwrap());
        SqliteSigningKeyDrivenStorage::new(sqlite)
    }

    fn active(key: AsymSigningKey) -> AsymSigningKey {
        AsymSigningKey {
            status: AsymSigningKeyStatus::Active,
            public_key: Some(b"{}".to_vec()),
            plugin_data: Some(vec![1, 2, 3]),
            ..key
        }
    }

    #[tokio::test]
    async fn it_should_create_key_with_first_version() {
        let storage = get_storage().await;

        let result = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap().version, 1);
    }

    #[tokio::test]
    async fn it_should_conflict_on_second_creating_key() {
        let storage = get_storage().await;
        storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();

        let result = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn it_should_conflict_on_second_active_key() {
        let storage = get_storage().await;
        let first = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        storage.update(&active(first)).await.unwrap();

        let second = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        let result = storage.update(&active(second)).await;

        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn it_should_update_key_and_bump_version() {
        let storage = get_storage().await;
        let key = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();

        let updated = storage.update(&active(key)).await.unwrap();
        let found = storage
            .find(&AsymSigningKeyFilter::status(&[AsymSigningKeyStatus::Active]))
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, 2);
        assert_eq!(found[0].plugin_data, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn it_should_conflict_on_stale_update() {
        let storage = get_storage().await;
        let key = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        storage.update(&active(key.clone())).await.unwrap();

        let result = storage.update(&active(key)).await;

        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn it_should_conflict_on_stale_delete() {
        let storage = get_storage().await;
        let key = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        storage.update(&active(key.clone())).await.unwrap();

        let result = storage.delete(&key).await;

        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn it_should_find_keys_with_public_key_ordered_by_creation() {
        let storage = get_storage().await;
        let now = Utc::now();

        let older = storage
            .create(&AsymSigningKey::new("memory", now - TimeDelta::hours(2)))
            .await
            .unwrap();
        let older = storage
            .update(&AsymSigningKey {
                status: AsymSigningKeyStatus::Decommissioning,
                public_key: Some(b"{}".to_vec()),
                ..older
            })
            .await
            .unwrap();
        let newer = storage
            .create(&AsymSigningKey::new("memory", now - TimeDelta::hours(1)))
            .await
            .unwrap();
        let newer = storage.update(&active(newer)).await.unwrap();
        storage
            .create(&AsymSigningKey::new("memory", now))
            .await
            .unwrap();

        let result = storage
            .find(&AsymSigningKeyFilter {
                public_key_not_empty: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let ids: Vec<String> = result.into_iter().map(|key| key.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn it_should_rollback_transaction() {
        let storage = get_storage().await;

        let tx = storage.begin().await.unwrap();
        tx.create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let result = storage.find(&AsymSigningKeyFilter::default()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn it_should_commit_transaction() {
        let storage = get_storage().await;
        let key = storage
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        let key = storage.update(&active(key)).await.unwrap();

        let tx = storage.begin().await.unwrap();
        tx.update(&AsymSigningKey {
            status: AsymSigningKeyStatus::Decommissioning,
            ..key
        })
        .await
        .unwrap();
        let replacement = tx
            .create(&AsymSigningKey::new("memory", Utc::now()))
            .await
            .unwrap();
        tx.update(&active(replacement.clone())).await.unwrap();
        tx.commit().await.unwrap();

        let result = storage
            .find(&AsymSigningKeyFilter::status(&[AsymSigningKeyStatus::Active]))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, replacement.id);
    }
}
