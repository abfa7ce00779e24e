use diesel_async::pooled_connection::deadpool::{BuildError, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type DbPool = Pool<AsyncPgConnection>;

/// Connections per gateway process. Presence traffic is KV-bound; Postgres
/// only sees membership lookups, message writes and delivery updates.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Build the Diesel async connection pool. Connections are opened lazily.
pub fn connect(database_url: &str, max_size: usize) -> Result<DbPool, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager).max_size(max_size).build()?;

    tracing::info!(max_size, "database pool created");

    Ok(pool)
}
