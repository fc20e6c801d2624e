// Sequential executor - FIFO serialization of async work
//
// Tasks submitted through `run` execute strictly one at a time, in
// submission order; each completes before the next starts. The quorum
// client funnels its config refreshes through one of these so at most one
// refresh is ever in flight.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

pub struct SeqExecutor {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SeqExecutor {
    /// Create the executor and its worker task. The worker exits when the
    /// executor is dropped.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
        });
        Self { tx }
    }

    /// Run `fut` after all previously submitted work has completed, and
    /// return its output.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        self.tx
            .send(task)
            .map_err(|_| Error::Transient("sequential executor worker gone".into()))?;
        done_rx
            .await
            .map_err(|_| Error::Transient("sequential task dropped".into()))
    }
}

impl Default for SeqExecutor {
    fn default() -> Self {
        Self::new()
    }
}
