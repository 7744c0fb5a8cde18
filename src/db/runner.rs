use anyhow::{anyhow, Result};
use diesel::result::QueryResult;
use std::future::Future;
use std::pin::Pin;

use super::{DbConnection, Object, Pool};

/// Runs a blocking Diesel closure on a pooled connection.
pub trait DbRunner: Send + Sync {
    fn run<F, T>(&self, f: F) -> Pin<Box<dyn Future<Output = Result<T>> + Send + '_>>
    where
        F: FnOnce(&mut DbConnection) -> QueryResult<T> + Send + 'static,
        T: Send + 'static;
}

impl DbRunner for Object {
    fn run<F, T>(&self, f: F) -> Pin<Box<dyn Future<Output = Result<T>> + Send + '_>>
    where
        F: FnOnce(&mut DbConnection) -> QueryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Box::pin(async move {
            match self.interact(f).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow!("DB interaction failed: {e}")),
            }
        })
    }
}

impl DbRunner for Pool {
    fn run<F, T>(&self, f: F) -> Pin<Box<dyn Future<Output = Result<T>> + Send + '_>>
    where
        F: FnOnce(&mut DbConnection) -> QueryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Box::pin(async move {
            let conn = self
                .get()
                .await
                .map_err(|e| anyhow!("failed to retrieve database connection: {e}"))?;
            conn.run(f).await
        })
    }
}
