use async_trait::async_trait;
use sea_orm::sea_query::{LikeExpr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Schema, Set,
};
use tether_core::{KvStore, StoreError};
use tether_entities::kv_entries;
use tracing::{debug, info};

fn is_table_already_exists_error(err: &DbErr) -> bool {
    err.to_string().contains("table") && err.to_string().contains("already exists")
}

/// `LIKE` pattern matching keys that start with `prefix` literally.
///
/// `\`, `%` and `_` are escaped with `\`, which is named as the escape
/// character so PostgreSQL, MySQL and SQLite read the pattern the same way.
fn prefix_pattern(prefix: &str) -> LikeExpr {
    let mut pattern = String::with_capacity(prefix.len() + 8);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    LikeExpr::new(pattern).escape('\\')
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: DbErr) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Durable store over a single `kv_entries` table.
pub struct DatabaseKvStore {
    db: DatabaseConnection,
}

impl DatabaseKvStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        Self::connect_with(ConnectOptions::new(database_url.to_owned())).await
    }

    pub async fn connect_with(options: ConnectOptions) -> anyhow::Result<Self> {
        info!("Connecting to database: {}", options.get_url());
        let db = Database::connect(options).await?;
        Self::from_connection(db).await
    }

    /// Wrap an existing connection, creating the table if missing.
    pub async fn from_connection(db: DatabaseConnection) -> anyhow::Result<Self> {
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        let stmt = schema.create_table_from_entity(kv_entries::Entity);
        match db
            .execute_unprepared(&backend.build(&stmt).to_string())
            .await
        {
            Ok(_) => {}
            Err(e) if is_table_already_exists_error(&e) => {
                info!("Table already exists, skipping creation");
            }
            Err(e) => return Err(e.into()),
        }

        info!("DatabaseKvStore initialized");
        Ok(Self { db })
    }

    #[must_use]
    pub const fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl KvStore for DatabaseKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let model = kv_entries::Entity::find_by_id(key.to_owned())
            .one(&self.db)
            .await
            .map_err(unavailable)?;
        Ok(model.map(|m| m.value))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let entry = kv_entries::ActiveModel {
            key: Set(key.to_owned()),
            value: Set(value.to_owned()),
            updated_at: Set(chrono::Utc::now().naive_utc()),
        };

        kv_entries::Entity::insert(entry)
            .on_conflict(
                OnConflict::column(kv_entries::Column::Key)
                    .update_columns([kv_entries::Column::Value, kv_entries::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(unavailable)?;

        debug!("Stored key: {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        kv_entries::Entity::delete_by_id(key.to_owned())
            .exec(&self.db)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys: Vec<String> = kv_entries::Entity::find()
            .select_only()
            .column(kv_entries::Column::Key)
            .filter(kv_entries::Column::Key.like(prefix_pattern(prefix)))
            .order_by_asc(kv_entries::Column::Key)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(unavailable)?;

        // SQLite's LIKE ignores ASCII case.
        Ok(keys
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}
