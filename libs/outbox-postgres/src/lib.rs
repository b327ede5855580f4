//! PostgreSQL storage driver for the outbox engine.
//!
//! Provides [`PgDriver`], a `StorageDriver` over sqlx whose claim runs
//! `FOR UPDATE SKIP LOCKED` so concurrent pollers never dispatch the same
//! record twice, and [`PgNotifyListener`], a LISTEN/NOTIFY wake-up channel
//! fed by the insert trigger shipped in `migrations/`.
//!
//! Business entities cross the outbox transaction boundary through the
//! [`PgEntity`] trait:
//!
//! ```rust,ignore
//! struct Order { id: i64, total: i64 }
//!
//! #[async_trait]
//! impl PgEntity for Order {
//!     async fn persist(&self, conn: &mut PgConnection) -> OutboxResult<()> {
//!         sqlx::query("INSERT INTO orders (id, total) VALUES ($1, $2)")
//!             .bind(self.id)
//!             .bind(self.total)
//!             .execute(conn)
//!             .await
//!             .map_err(OutboxError::storage)?;
//!         Ok(())
//!     }
//!
//!     async fn remove(&self, conn: &mut PgConnection) -> OutboxResult<()> {
//!         sqlx::query("DELETE FROM orders WHERE id = $1")
//!             .bind(self.id)
//!             .execute(conn)
//!             .await
//!             .map_err(OutboxError::storage)?;
//!         Ok(())
//!     }
//! }
//!
//! emitter.emit(event, vec![PgEntityOp::persist(order)]).await?;
//! ```

pub mod driver;
pub mod entity;
pub mod listener;

pub use driver::{PgDriver, PgUnitOfWork};
pub use entity::{PgEntity, PgEntityOp};
pub use listener::{PgNotifyListener, DEFAULT_NOTIFY_CHANNEL};

/// Embedded schema migrations (table, retry-tracking evolution, NOTIFY
/// trigger).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Apply the outbox schema migrations.
pub async fn run_migrations(pool: &sqlx::PgPool) -> outbox_core::OutboxResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(outbox_core::OutboxError::storage)
}
