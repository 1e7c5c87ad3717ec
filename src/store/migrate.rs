use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_origin_port.up.sql"),
        down_sql: include_str!("sql/002_origin_port.down.sql"),
    },
];

/// Manages SQLite schema migrations.
///
/// Tracks state in a single-row `schema_migrations` table with a dirty
/// flag, golang-migrate style. Embeds SQL files from `store/sql/` and
/// applies them in order.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// SQLite migration runner.
pub struct SqliteMigrator {
    pool: SqlitePool,
}

impl SqliteMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensures the schema_migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER NOT NULL,
                dirty INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        Ok(())
    }

    /// Returns the current migration version and dirty state.
    async fn current_version(&self) -> Result<(u32, bool)> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT version, dirty FROM schema_migrations LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("querying migration version")?;

        match row {
            Some((version, dirty)) => Ok((version as u32, dirty != 0)),
            None => Ok((0, false)),
        }
    }

    /// Sets the migration version in the tracking table.
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        // Clear and re-insert (matches golang-migrate behavior).
        sqlx::query("DELETE FROM schema_migrations")
            .execute(&self.pool)
            .await
            .context("clearing schema_migrations")?;

        sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES (?, ?)")
            .bind(version as i64)
            .bind(if dirty { 1i64 } else { 0i64 })
            .execute(&self.pool)
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    /// Splits a SQL string into individual statements and executes each.
    ///
    /// All statements of one migration run on a single pooled connection:
    /// DDL prepared on a connection whose schema cache predates a sibling
    /// connection's DDL fails at parse time (e.g. CREATE INDEX after a
    /// DROP it never saw).
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring connection for SQL execution")?;

        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("executing migration statement: {preview}...")
                })?;
        }

        Ok(())
    }
}

impl Migrator for SqliteMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(current_version, "running migrations");

        let mut applied = 0u32;

        for migration in MIGRATIONS {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(version = migration.version, "applying migration");

            // Mark as dirty before applying.
            self.set_version(migration.version, true).await?;

            // Execute the migration SQL.
            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            // Mark as clean.
            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        // Find the migration matching current version.
        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        // Mark as dirty.
        self.set_version(current_version, true).await?;

        // Execute the down SQL.
        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        // Set version to previous migration.
        let prev_version = MIGRATIONS
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        if prev_version == 0 {
            // No previous version, clear the tracking table.
            sqlx::query("DELETE FROM schema_migrations")
                .execute(&self.pool)
                .await
                .context("clearing schema_migrations after rollback")?;
        } else {
            self.set_version(prev_version, false).await?;
        }

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines, comments, and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
