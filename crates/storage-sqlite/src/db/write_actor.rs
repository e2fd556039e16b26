//! Serializes every write through one connection inside an immediate transaction.

use diesel::sqlite::SqliteConnection;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use menusync_core::errors::{Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send>;

/// Either the closure failed or the transaction machinery did.
enum TxError {
    Domain(Error),
    Db(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Db(err)
    }
}

#[derive(Clone)]
pub struct WriteHandle {
    sender: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    /// Runs `job` on the writer connection. The transaction commits when
    /// `job` returns `Ok` and rolls back otherwise.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let wrapped: Job = Box::new(move |conn| {
            let result = conn
                .immediate_transaction(|tx| job(tx).map_err(TxError::Domain))
                .map_err(|err| match err {
                    TxError::Domain(err) => err,
                    TxError::Db(err) => StorageError::from(err).into(),
                });
            // The caller may have gone away; nothing to report then.
            let _ = reply.send(result);
        });

        self.sender
            .send(wrapped)
            .map_err(|_| StorageError::Writer("writer thread stopped".to_string()))?;
        response
            .await
            .map_err(|_| StorageError::Writer("writer dropped the request".to_string()))?
    }
}

/// Starts the writer on a dedicated thread holding one pooled connection.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
    std::thread::spawn(move || {
        let mut conn = match pool.get() {
            Ok(conn) => conn,
            Err(err) => {
                error!("[MenuSync] Writer could not acquire a connection: {}", err);
                return;
            }
        };
        debug!("[MenuSync] Writer started");
        while let Some(job) = receiver.blocking_recv() {
            job(&mut *conn);
        }
        debug!("[MenuSync] Writer stopped");
    });
    WriteHandle { sender }
}
