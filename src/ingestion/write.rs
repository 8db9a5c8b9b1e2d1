//! Write functions - provision snapshot tables and bulk-load CSVs into PostgreSQL

use crate::ingestion::error::{LoadError, ProvisionError};
use crate::ingestion::parse::{is_empty_file, row_reader, validate_header, AvailabilityRow};
use crate::ingestion::schema::{column_names, copy_sql, create_table_sql, matches_fixed_columns, TableName, COLUMNS};
use crate::ingestion::types::ProvisionOutcome;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolCopyExt, Postgres};
use sqlx::{PgPool, QueryBuilder};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Postgres caps a statement at 65535 bind parameters
const MAX_BATCH_ROWS: usize = u16::MAX as usize / COLUMNS.len();
const COPY_CHUNK_BYTES: usize = 256 * 1024;

/// Destination for snapshot rows
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the table with the fixed schema unless it already exists
    async fn ensure_table(&self, table: &TableName) -> Result<ProvisionOutcome, ProvisionError>;

    /// Append every row of `path` in one atomic operation, returning the row count
    async fn load_csv(&self, table: &TableName, path: &Path) -> Result<u64, LoadError>;

    async fn row_count(&self, table: &TableName) -> Result<u64, LoadError>;
}

/// How rows reach the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// `COPY ... FROM STDIN`, the native bulk path
    Copy,
    /// Multi-row `INSERT`s inside one transaction
    BatchedInsert { batch_size: usize },
}

impl Default for LoadStrategy {
    fn default() -> Self {
        LoadStrategy::Copy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: String,
}

#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
    strategy: LoadStrategy,
    verify_schema_on_reuse: bool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        PgTableStore {
            pool,
            strategy: LoadStrategy::default(),
            verify_schema_on_reuse: false,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Fail provisioning when a reused table's columns differ from the fixed schema
    pub fn verify_schema_on_reuse(mut self, verify: bool) -> Self {
        self.verify_schema_on_reuse = verify;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn table_exists(&self, table: &TableName) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(table.as_str())
        .fetch_one(&self.pool)
        .await
    }

    /// Column names and types, in ordinal order
    pub async fn describe_table(&self, table: &TableName) -> Result<Vec<ColumnInfo>, sqlx::Error> {
        sqlx::query_as::<_, ColumnInfo>(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await
    }

    async fn check_reused_table(&self, table: &TableName) -> Result<(), ProvisionError> {
        let found: Vec<String> = self
            .describe_table(table)
            .await?
            .into_iter()
            .map(|c| c.column_name)
            .collect();

        if matches_fixed_columns(&found) {
            return Ok(());
        }

        let expected: Vec<String> = column_names().iter().map(|c| c.to_string()).collect();
        if self.verify_schema_on_reuse {
            return Err(ProvisionError::SchemaMismatch {
                table: table.to_string(),
                expected,
                found,
            });
        }

        warn!(
            "Table {} exists with columns {:?}; reusing it as-is (expected {:?})",
            table, found, expected
        );
        Ok(())
    }

    async fn copy_file(&self, table: &TableName, path: &Path) -> Result<u64, LoadError> {
        let mut copy = self.pool.copy_in_raw(&copy_sql(table)).await?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    if let Err(abort) = copy.abort("local read failed").await {
                        debug!("COPY abort reported: {}", abort);
                    }
                    return Err(LoadError::Io(e));
                }
            };
            if n == 0 {
                break;
            }
            copy.send(&buf[..n]).await?;
        }

        // The server validates rows as they stream; a bad one fails the whole COPY here
        let rows = copy.finish().await?;
        Ok(rows)
    }

    async fn insert_batches(
        &self,
        table: &TableName,
        path: &Path,
        batch_size: usize,
    ) -> Result<u64, LoadError> {
        let batch_size = batch_size.clamp(1, MAX_BATCH_ROWS);
        let mut reader = row_reader(path)?;
        let mut rows = reader.deserialize::<AvailabilityRow>();

        let mut tx = self.pool.begin().await?;
        let mut loaded: u64 = 0;

        loop {
            let mut batch = Vec::with_capacity(batch_size);
            for result in rows.by_ref().take(batch_size) {
                let row = result
                    .map_err(|e| LoadError::Rejected(format!("row {}: {}", loaded as usize + batch.len() + 1, e)))?;
                batch.push(row);
            }
            if batch.is_empty() {
                break;
            }

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                table,
                column_names().join(", ")
            ));
            builder.push_values(batch.iter(), |mut b, row| {
                b.push_bind(row.frn)
                    .push_bind(row.provider_id)
                    .push_bind(row.brand_name.as_deref())
                    .push_bind(row.location_id)
                    .push_bind(row.technology)
                    .push_bind(row.max_advertised_download_speed)
                    .push_bind(row.max_advertised_upload_speed)
                    .push_bind(row.low_latency)
                    .push_bind(row.business_residential_code.as_deref())
                    .push_bind(row.state_usps.as_deref())
                    .push_bind(row.block_geoid)
                    .push_bind(row.h3_res8_id.as_deref());
            });
            builder.build().execute(&mut *tx).await?;

            loaded += batch.len() as u64;
            debug!("Inserted batch into {} ({} rows so far)", table, loaded);
        }

        // Dropping `tx` on any early return above rolls back every batch
        tx.commit().await?;
        Ok(loaded)
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn ensure_table(&self, table: &TableName) -> Result<ProvisionOutcome, ProvisionError> {
        if self.table_exists(table).await? {
            info!("Table {} already exists", table);
            self.check_reused_table(table).await?;
            return Ok(ProvisionOutcome::AlreadyExisted);
        }

        sqlx::query(&create_table_sql(table))
            .execute(&self.pool)
            .await?;
        info!("Created table {}", table);
        Ok(ProvisionOutcome::Created)
    }

    async fn load_csv(&self, table: &TableName, path: &Path) -> Result<u64, LoadError> {
        if is_empty_file(path)? {
            info!("{:?} is empty, nothing to load", path);
            return Ok(0);
        }
        validate_header(path)?;

        let rows = match self.strategy {
            LoadStrategy::Copy => self.copy_file(table, path).await?,
            LoadStrategy::BatchedInsert { batch_size } => {
                self.insert_batches(table, path, batch_size).await?
            }
        };

        info!("Loaded {} rows from {:?} into {}", rows, path, table);
        Ok(rows)
    }

    async fn row_count(&self, table: &TableName) -> Result<u64, LoadError> {
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
