//! In-process worker doubles for job tests

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use cachelog_worker::{
    ProgressSink, Worker, WorkerError, WorkerOutput, WorkerProgress, WorkerRequest,
};

use crate::error::StoreError;
use crate::position::{MemoryPositionStore, PositionStore};

/// Worker whose invocations stay pending until the test resolves them
pub struct GatedWorker {
    calls: mpsc::UnboundedSender<Invocation>,
}

impl GatedWorker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Invocation>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }
}

impl Worker for GatedWorker {
    fn invoke(
        &self,
        request: WorkerRequest,
        progress: Option<ProgressSink>,
    ) -> BoxFuture<'static, Result<WorkerOutput, WorkerError>> {
        let (reply, outcome) = oneshot::channel();
        let _ = self.calls.send(Invocation {
            request,
            progress,
            reply,
        });
        async move {
            outcome.await.unwrap_or_else(|_| {
                Err(WorkerError::Io(std::io::Error::other("invocation dropped")))
            })
        }
        .boxed()
    }
}

/// One pending call into a [`GatedWorker`]
pub struct Invocation {
    pub request: WorkerRequest,
    progress: Option<ProgressSink>,
    reply: oneshot::Sender<Result<WorkerOutput, WorkerError>>,
}

impl Invocation {
    pub fn report(&self, progress: WorkerProgress) {
        if let Some(sink) = &self.progress {
            let _ = sink.send(progress);
        }
    }

    /// Finish successfully with `document` (must be a JSON object)
    pub fn complete(self, document: Value) {
        let Value::Object(map) = document else {
            panic!("worker output must be a JSON object");
        };
        let _ = self.reply.send(Ok(WorkerOutput::new(map)));
    }

    pub fn fail(self, error: WorkerError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Worker that answers every request immediately from a closure
pub struct FnWorker<F>(F);

impl<F> FnWorker<F>
where
    F: Fn(&WorkerRequest) -> Result<WorkerOutput, WorkerError> + Send + Sync + 'static,
{
    pub fn new(respond: F) -> Self {
        Self(respond)
    }
}

impl<F> Worker for FnWorker<F>
where
    F: Fn(&WorkerRequest) -> Result<WorkerOutput, WorkerError> + Send + Sync + 'static,
{
    fn invoke(
        &self,
        request: WorkerRequest,
        _progress: Option<ProgressSink>,
    ) -> BoxFuture<'static, Result<WorkerOutput, WorkerError>> {
        let result = (self.0)(&request);
        async move { result }.boxed()
    }
}

/// Position store that loads fine but can never write
#[derive(Debug, Default)]
pub struct FailingStore {
    position: u64,
}

impl FailingStore {
    pub fn new(position: u64) -> Self {
        Self { position }
    }
}

impl PositionStore for FailingStore {
    fn load(&self) -> Result<u64, StoreError> {
        Ok(self.position)
    }

    fn save(&self, _position: u64) -> Result<(), StoreError> {
        Err(StoreError::Write {
            path: PathBuf::from("/readonly/position.json"),
            source: std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            ),
        })
    }
}

/// Memory store whose writes block the calling thread until released
#[derive(Debug, Default)]
pub struct GatedStore {
    inner: MemoryPositionStore,
    saving: AtomicBool,
    released: AtomicBool,
}

impl GatedStore {
    /// A write is waiting for [`GatedStore::release`]
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl PositionStore for GatedStore {
    fn load(&self) -> Result<u64, StoreError> {
        self.inner.load()
    }

    fn save(&self, position: u64) -> Result<(), StoreError> {
        self.saving.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inner.save(position)
    }
}

pub fn output(document: Value) -> WorkerOutput {
    match document {
        Value::Object(map) => WorkerOutput::new(map),
        _ => panic!("worker output must be a JSON object"),
    }
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Receive the next worker call, panicking if none arrives
pub async fn next_call(calls: &mut mpsc::UnboundedReceiver<Invocation>) -> Invocation {
    tokio::time::timeout(Duration::from_secs(5), calls.recv())
        .await
        .expect("timed out waiting for worker call")
        .expect("worker dropped")
}
