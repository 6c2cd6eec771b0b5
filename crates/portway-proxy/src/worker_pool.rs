//! Fixed-size worker pool with a bounded hand-off queue.
//!
//! `N` long-lived workers share a queue of capacity `2N`. Submission
//! never blocks the accept loop: when the queue is full the connection
//! is dropped on the floor, which closes it. Shutdown closes the queue
//! and waits for every worker; handlers already running complete.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

pub(crate) struct WorkerPool {
    queue_tx: mpsc::Sender<TcpStream>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Starts `size` workers running `handler` for each dequeued
    /// connection. Workers exit when `shutdown_rx` observes a change or
    /// the queue closes.
    pub(crate) fn start<H, F>(size: usize, shutdown_rx: watch::Receiver<bool>, handler: H) -> Self
    where
        H: Fn(TcpStream) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(size.max(1) * 2);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut workers = JoinSet::new();
        for _ in 0..size {
            let handler = handler.clone();
            let queue_rx = Arc::clone(&queue_rx);
            let mut shutdown_rx = shutdown_rx.clone();
            workers.spawn(async move {
                loop {
                    let received = {
                        let mut queue = queue_rx.lock().await;
                        tokio::select! {
                            _ = shutdown_rx.changed() => return,
                            received = queue.recv() => received,
                        }
                    };
                    match received {
                        Some(stream) => handler(stream).await,
                        None => return,
                    }
                }
            });
        }

        Self { queue_tx, workers }
    }

    /// Non-blocking enqueue. A full queue drops `stream`, closing the
    /// client connection without a response.
    pub(crate) fn submit(&self, stream: TcpStream) {
        if self.queue_tx.try_send(stream).is_err() {
            tracing::debug!("worker queue full, dropping connection");
        }
    }

    /// Closes the queue and waits for all workers to finish their
    /// current handlers and exit.
    pub(crate) async fn shutdown(self) {
        let Self {
            queue_tx,
            mut workers,
        } = self;
        drop(queue_tx);
        while workers.join_next().await.is_some() {}
    }
}
