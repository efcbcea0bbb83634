use store::Transaction;

use crate::error::Result;

/// Commits `tx` if `outcome` succeeded, otherwise rolls it back and returns
/// the original error.
pub(crate) async fn finish<T: Transaction, R>(tx: T, outcome: Result<R>) -> Result<R> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
