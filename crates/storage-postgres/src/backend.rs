//! [`ObjStorage`] over a PostgreSQL table with a `jsonb` record column.

use std::{collections::HashSet, fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use fimidx_storage::{
    CleanupResult, DeleteParams, DeleteResult, HealthReport, Identity, Lifecycle, Obj, ObjFilter,
    ObjStorage, ReadParams, ReadResult, StorageConfig, StorageError, StorageResult,
    TransactionalStorage, UpdateParams, UpdateResult, UpsertBatch, UpsertScope, merge_records,
    obj, record_to_json, sort::resolve_sort,
};
use futures::future::BoxFuture;
use sqlx::{
    PgConnection, PgPool, Postgres, QueryBuilder, Transaction, postgres::PgPoolOptions,
    types::Json,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::PostgresConfig,
    error::{PostgresStorageError, sqlx_error_to_storage_error},
    filter::{push_filter, push_identity_match, push_order_by},
    row::{COLUMNS, MAX_ROWS_PER_INSERT, ObjRow, push_obj},
    schema,
};

/// Runs one statement on the handle's transaction, if it has one, or on the
/// pool.
macro_rules! with_conn {
    ($storage:expr, |$conn:ident| $body:expr) => {
        match &$storage.tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let $conn: &mut PgConnection = &mut guard;
                $body
            },
            None => {
                let $conn = &$storage.pool;
                $body
            },
        }
        .map_err(sqlx_error_to_storage_error)
    };
}

/// Runs several statements atomically: inside the handle's transaction, or
/// inside a short one of their own.
macro_rules! in_transaction {
    ($storage:expr, |$conn:ident| $body:expr) => {
        match &$storage.tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                let $conn: &mut PgConnection = &mut guard;
                $body
            },
            None => {
                let mut local =
                    $storage.pool.begin().await.map_err(sqlx_error_to_storage_error)?;
                let $conn: &mut PgConnection = &mut local;
                let value = $body?;
                local.commit().await.map_err(sqlx_error_to_storage_error)?;
                Ok(value)
            },
        }
    };
}

fn count(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn bind_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn rows_to_objs(rows: Vec<ObjRow>) -> StorageResult<Vec<Obj>> {
    rows.into_iter().map(|row| Obj::try_from(row).map_err(StorageError::from)).collect()
}

/// PostgreSQL-backed object storage.
///
/// Every object is one row; the record is a `jsonb` column and the envelope
/// fields are plain columns.
///
/// # Cloning
///
/// Clones share the connection pool.
///
/// # Transactions
///
/// [`with_transaction`](TransactionalStorage::with_transaction) checks out a
/// connection, opens a transaction on it and hands the closure a handle that
/// runs every statement there. Serialization failures and deadlocks surface
/// as [`TransactionAborted`](StorageError::TransactionAborted).
#[derive(Clone)]
pub struct PostgresObjStorage {
    pool: PgPool,
    config: PostgresConfig,
    tx: Option<Arc<Mutex<Transaction<'static, Postgres>>>>,
}

impl fmt::Debug for PostgresObjStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresObjStorage")
            .field("table", &self.config.table())
            .field("pool_size", &self.pool.size())
            .field("in_transaction", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresObjStorage {
    /// Opens a connection pool and, unless disabled, creates the table and
    /// its indexes.
    ///
    /// # Errors
    ///
    /// Returns [`Validation`](StorageError::Validation) for a bad
    /// configuration, or a driver error mapped to [`StorageError`].
    pub async fn connect(config: PostgresConfig) -> StorageResult<Self> {
        config.validate().map_err(PostgresStorageError::from)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections())
            .min_connections(config.min_connections())
            .acquire_timeout(config.acquire_timeout())
            .connect(config.url())
            .await
            .map_err(sqlx_error_to_storage_error)?;

        let storage = Self::from_pool(pool, config);
        if storage.config.migrate() {
            storage.migrate().await?;
        }
        info!(table = storage.table(), "Connected to PostgreSQL");
        Ok(storage)
    }

    /// Wraps an existing pool. The schema is left alone.
    #[must_use]
    pub fn from_pool(pool: PgPool, config: PostgresConfig) -> Self {
        Self { pool, config, tx: None }
    }

    /// Returns the backend configuration.
    #[must_use]
    pub fn postgres_config(&self) -> &PostgresConfig {
        &self.config
    }

    fn table(&self) -> &str {
        self.config.table()
    }

    /// Creates the objects table and its indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns the driver error mapped to [`StorageError`].
    pub async fn migrate(&self) -> StorageResult<()> {
        for statement in schema::statements(self.table()) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(sqlx_error_to_storage_error)?;
        }
        debug!(table = self.table(), "Schema is up to date");
        Ok(())
    }

    /// Returns the ids among `ids` that are already taken.
    async fn existing_ids(&self, ids: Vec<String>) -> StorageResult<Vec<String>> {
        let sql = format!("SELECT id FROM {} WHERE id = ANY($1)", self.table());
        with_conn!(self, |conn| {
            sqlx::query_scalar::<_, String>(&sql).bind(&ids).fetch_all(conn).await
        })
    }
}

async fn insert_rows(conn: &mut PgConnection, table: &str, objs: &[Obj]) -> StorageResult<()> {
    for chunk in objs.chunks(MAX_ROWS_PER_INSERT) {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} ({COLUMNS}) "));
        builder.push_values(chunk, |row, obj| push_obj(row, obj));
        builder.build().execute(&mut *conn).await.map_err(sqlx_error_to_storage_error)?;
    }
    Ok(())
}

/// Locks the matching rows, merges the payload into each and writes them
/// back. Returns how many rows changed.
async fn update_rows(
    conn: &mut PgConnection,
    table: &str,
    filter: &ObjFilter,
    params: &UpdateParams,
) -> StorageResult<usize> {
    let mut select =
        QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM {table} WHERE "));
    push_filter(&mut select, filter);
    select.push(" ORDER BY id COLLATE \"C\" FOR UPDATE");
    let rows = select
        .build_query_as::<ObjRow>()
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_storage_error)?;

    let sql = format!(
        "UPDATE {table} SET obj_record = $1, updated_at = $2, updated_by = $3, \
         updated_by_type = $4 WHERE id = $5 AND deleted_at IS NULL"
    );
    let now = obj::now();
    let mut updated_count = 0;
    for row in rows {
        let existing = Obj::try_from(row)?;
        let merged = merge_records(&existing.obj_record, &params.update, params.update_way);
        let result = sqlx::query(&sql)
            .bind(Json(record_to_json(&merged)))
            .bind(now)
            .bind(&params.by)
            .bind(&params.by_type)
            .bind(&existing.id)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        updated_count += count(result.rows_affected());
    }
    Ok(updated_count)
}

/// Inserts, then overwrites every column of each replacement in order.
async fn write_batch(
    conn: &mut PgConnection,
    table: &str,
    batch: &UpsertBatch,
) -> StorageResult<()> {
    insert_rows(conn, table, &batch.inserts).await?;
    for obj in &batch.replacements {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("UPDATE {table} SET ({COLUMNS}) = ("));
        push_obj(builder.separated(", "), obj);
        builder.push(") WHERE id = ").push_bind(obj.id.clone());
        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(format!("object {}", obj.id)));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjStorage for PostgresObjStorage {
    fn config(&self) -> &StorageConfig {
        self.config.storage()
    }

    #[tracing::instrument(skip_all, fields(count = objs.len()))]
    async fn create(&self, objs: Vec<Obj>) -> StorageResult<Vec<Obj>> {
        if objs.is_empty() {
            return Ok(objs);
        }
        let mut incoming = HashSet::new();
        if let Some(dup) = objs.iter().find(|o| !incoming.insert(o.id.as_str())) {
            return Err(StorageError::conflict(format!("object {} already exists", dup.id)));
        }
        // Checked up front so a conflict does not poison an enclosing
        // transaction. The primary key still catches races.
        let taken = self.existing_ids(objs.iter().map(|o| o.id.clone()).collect()).await?;
        if let Some(id) = taken.first() {
            return Err(StorageError::conflict(format!("object {id} already exists")));
        }
        in_transaction!(self, |conn| insert_rows(conn, self.table(), &objs).await)?;
        Ok(objs)
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn read(&self, params: ReadParams) -> StorageResult<ReadResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, params.lifecycle, &params.fields)?
                .after(params.after_id.as_deref());
        let keys = resolve_sort(&params.sort, &params.fields);
        let limit = params.limit.unwrap_or(self.config().default_limit());
        let offset = match params.after_id {
            Some(_) => 0,
            None => params.page.unwrap_or(0).saturating_mul(limit),
        };

        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM {} WHERE ", self.table()));
        push_filter(&mut builder, &filter);
        push_order_by(&mut builder, &keys);
        // One extra row tells whether another page exists.
        builder
            .push(" LIMIT ")
            .push_bind(bind_count(limit.saturating_add(1)))
            .push(" OFFSET ")
            .push_bind(bind_count(offset));

        let rows = with_conn!(self, |conn| {
            builder.build_query_as::<ObjRow>().fetch_all(conn).await
        })?;
        let mut objs = rows_to_objs(rows)?;
        let has_more = objs.len() > limit;
        objs.truncate(limit);
        Ok(ReadResult { objs, has_more })
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn update(&self, params: UpdateParams) -> StorageResult<UpdateResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, Lifecycle::Live, &params.fields)?;
        let updated_count =
            in_transaction!(self, |conn| update_rows(conn, self.table(), &filter, &params).await)?;
        Ok(UpdateResult { updated_count })
    }

    #[tracing::instrument(skip_all, fields(tag = %params.tag, app_id = %params.query.app_id))]
    async fn delete(&self, params: DeleteParams) -> StorageResult<DeleteResult> {
        let filter =
            ObjFilter::compile(&params.query, &params.tag, Lifecycle::Live, &params.fields)?;
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("UPDATE {} SET deleted_at = ", self.table()));
        builder
            .push_bind(obj::now())
            .push(", deleted_by = ")
            .push_bind(params.deleted_by.clone())
            .push(", deleted_by_type = ")
            .push_bind(params.deleted_by_type.clone())
            .push(" WHERE ");
        push_filter(&mut builder, &filter);

        let result = with_conn!(self, |conn| builder.build().execute(conn).await)?;
        Ok(DeleteResult { deleted_count: count(result.rows_affected()) })
    }

    #[tracing::instrument(skip_all)]
    async fn cleanup_deleted_objs(&self) -> StorageResult<CleanupResult> {
        let cutoff = obj::retention_cutoff(self.config().cleanup_retention());
        let sql = format!(
            "DELETE FROM {} WHERE deleted_at IS NOT NULL AND deleted_at <= $1",
            self.table()
        );
        let result = with_conn!(self, |conn| sqlx::query(&sql).bind(cutoff).execute(conn).await)?;
        let cleaned_count = count(result.rows_affected());
        debug!(cleaned_count, "Purged soft-deleted objects");
        Ok(CleanupResult { cleaned_count })
    }

    async fn health_check(&self) -> StorageResult<HealthReport> {
        let start = Instant::now();
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                StorageError::backend_unavailable_with_source("PostgreSQL ping failed", e)
            })?;
        Ok(HealthReport::new("postgres", start.elapsed())
            .with_detail("table", self.table())
            .with_detail("pool_size", self.pool.size().to_string())
            .with_detail("idle_connections", self.pool.num_idle().to_string()))
    }

    #[tracing::instrument(skip_all, fields(tag = %scope.tag, count = identities.len()))]
    async fn find_by_identity(
        &self,
        scope: &UpsertScope,
        keys: &[String],
        identities: &[Identity],
    ) -> StorageResult<Vec<Obj>> {
        if identities.is_empty() || keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM {} WHERE ", self.table()));
        push_identity_match(&mut builder, scope, keys, identities);
        builder.push(" ORDER BY created_at ASC, id COLLATE \"C\" ASC");

        let rows = with_conn!(self, |conn| {
            builder.build_query_as::<ObjRow>().fetch_all(conn).await
        })?;
        rows_to_objs(rows)
    }

    #[tracing::instrument(
        skip_all,
        fields(inserts = batch.inserts.len(), replacements = batch.replacements.len())
    )]
    async fn write_upsert_batch(&self, batch: UpsertBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        in_transaction!(self, |conn| write_batch(conn, self.table(), &batch).await)
    }
}

#[async_trait]
impl TransactionalStorage for PostgresObjStorage {
    #[tracing::instrument(skip_all)]
    async fn with_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'tx> FnOnce(&'tx dyn ObjStorage) -> BoxFuture<'tx, StorageResult<T>> + Send,
    {
        // Nested calls join the enclosing transaction.
        if self.tx.is_some() {
            return f(self).await;
        }

        let tx = self.pool.begin().await.map_err(sqlx_error_to_storage_error)?;
        let tx = Arc::new(Mutex::new(tx));
        let handle = Self { tx: Some(Arc::clone(&tx)), ..self.clone() };

        let outcome = f(&handle).await;
        drop(handle);
        let tx = Arc::try_unwrap(tx)
            .map_err(|_| StorageError::internal("transaction handle outlived its closure"))?
            .into_inner();
        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(|e| {
                    warn!(error = %e, "Transaction commit failed");
                    StorageError::transaction_aborted_with_source("commit failed", e)
                })?;
                debug!("Transaction committed");
                Ok(value)
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back transaction");
                }
                debug!(error = %err, "Transaction body failed, rolled back");
                Err(err)
            },
        }
    }
}
