//! Adapter that carries caller-owned entities through the engine's opaque
//! entity channel into the PostgreSQL transaction.

use async_trait::async_trait;
use outbox_core::{EntityOp, OutboxResult};
use sqlx::PgConnection;

/// A business entity this driver knows how to write inside the outbox
/// transaction. Implementations issue their own SQL against the supplied
/// connection, which is always a transaction the driver is about to commit.
#[async_trait]
pub trait PgEntity: Send + Sync {
    async fn persist(&self, conn: &mut PgConnection) -> OutboxResult<()>;

    async fn remove(&self, conn: &mut PgConnection) -> OutboxResult<()>;
}

/// Concrete wrapper the unit of work downcasts the opaque `EntityOp` payload
/// to. Build ops with [`PgEntityOp::persist`] / [`PgEntityOp::remove`].
pub struct PgEntityOp(pub Box<dyn PgEntity>);

impl PgEntityOp {
    pub fn persist(entity: impl PgEntity + 'static) -> EntityOp {
        EntityOp::persist(PgEntityOp(Box::new(entity)))
    }

    pub fn remove(entity: impl PgEntity + 'static) -> EntityOp {
        EntityOp::remove(PgEntityOp(Box::new(entity)))
    }
}
