//! PostgreSQL access for inpainting records.

use crate::models::{InpaintResult, NewInpaintResult};
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn record_query(operation: &'static str, start: Instant) {
    metrics::histogram!(DB_QUERY_DURATION, "operation" => operation)
        .record(start.elapsed().as_secs_f64());
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "inpaint-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Pool that only connects on first use. Lets the router come up without
    /// a reachable database; queries then fail after `acquire_timeout`.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Invalid database URL: {}", e))
            })?;
        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    #[instrument(skip(self, input), fields(result_id = %input.id, iterations = input.iterations.get()))]
    pub async fn insert_inpaint_result(
        &self,
        input: &NewInpaintResult,
    ) -> Result<InpaintResult, AppError> {
        let start = Instant::now();

        let result = sqlx::query_as::<_, InpaintResult>(
            r#"
            INSERT INTO inpaint_results (id, original_image, mask_image, result_image, iterations)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, original_image, mask_image, result_image, iterations, created_utc
            "#,
        )
        .bind(input.id)
        .bind(&input.original_image)
        .bind(&input.mask_image)
        .bind(&input.result_image)
        .bind(input.iterations.get() as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert inpaint result: {}", e))
        })?;

        record_query("insert_inpaint_result", start);
        info!(result_id = %result.id, "Inpaint result stored");

        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn get_inpaint_result(&self, id: Uuid) -> Result<Option<InpaintResult>, AppError> {
        let start = Instant::now();

        let result = sqlx::query_as::<_, InpaintResult>(
            r#"
            SELECT id, original_image, mask_image, result_image, iterations, created_utc
            FROM inpaint_results
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get inpaint result: {}", e))
        })?;

        record_query("get_inpaint_result", start);
        Ok(result)
    }

    /// Newest first.
    #[instrument(skip(self))]
    pub async fn list_inpaint_results(&self, limit: i64) -> Result<Vec<InpaintResult>, AppError> {
        let start = Instant::now();

        let results = sqlx::query_as::<_, InpaintResult>(
            r#"
            SELECT id, original_image, mask_image, result_image, iterations, created_utc
            FROM inpaint_results
            ORDER BY created_utc DESC, id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list inpaint results: {}", e))
        })?;

        record_query("list_inpaint_results", start);
        Ok(results)
    }

    /// Removes a record; used by tests and for manual cleanup.
    #[instrument(skip(self))]
    pub async fn delete_inpaint_result(&self, id: Uuid) -> Result<bool, AppError> {
        let start = Instant::now();

        let outcome = sqlx::query("DELETE FROM inpaint_results WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete inpaint result: {}", e))
            })?;

        record_query("delete_inpaint_result", start);
        Ok(outcome.rows_affected() > 0)
    }
}
