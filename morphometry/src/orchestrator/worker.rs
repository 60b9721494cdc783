use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::Shared;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::Image;
use crate::stage::{ImageStage, StageOutcome};

#[derive(Debug)]
pub enum WorkerMessage {
    Process(Image),
    /// Finish the queued images, then stop.
    Exit,
}

#[derive(Debug)]
pub struct WorkOutcome {
    pub image: Image,
    pub result: Result<StageOutcome>,
}

/// Runs [`ImageStage::process`] for queued images, at most `concurrency` at
/// a time, and reports every finished image through the callback.
#[derive(Debug)]
pub struct Worker {
    handle: Option<JoinHandle<()>>,
    tx: UnboundedSender<WorkerMessage>,
    exit_sent: AtomicBool,
}

impl Worker {
    pub fn new<Callback>(stage: Arc<ImageStage>, concurrency: usize, callback: Callback) -> Self
    where
        Callback: Fn(WorkOutcome) + Send + 'static,
    {
        let callback: Shared<Callback> = Shared::new(callback);
        let (tx, rx) = unbounded_channel::<WorkerMessage>();
        let handle = tokio::spawn(worker_loop(rx, stage, concurrency.max(1), callback));

        Self {
            handle: Some(handle),
            tx,
            exit_sent: AtomicBool::new(false),
        }
    }

    pub fn send(&self, msg: WorkerMessage) {
        if self.tx.send(msg).is_err() {
            warn!("Worker loop already stopped, message dropped");
        }
    }

    pub fn process(&self, image: Image) {
        self.send(WorkerMessage::Process(image));
    }

    /// Asks the loop to stop once the queue drains. Returns `false` when an
    /// exit was already requested.
    pub fn exit(&self) -> bool {
        if self.exit_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(WorkerMessage::Exit);
        true
    }

    /// Requests exit and waits until every queued image was reported.
    pub async fn join(mut self) -> Result<()> {
        self.exit();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            error!("Worker dropped while the loop is still running; call Worker::join() first");
        }
    }
}

async fn worker_loop<Callback>(
    mut rx: UnboundedReceiver<WorkerMessage>,
    stage: Arc<ImageStage>,
    concurrency: usize,
    callback: Shared<Callback>,
) where
    Callback: Fn(WorkOutcome) + Send + 'static,
{
    let mut queue: VecDeque<Image> = VecDeque::new();
    let mut pending: JoinSet<WorkOutcome> = JoinSet::new();
    let mut exiting = false;

    loop {
        while pending.len() < concurrency {
            let Some(image) = queue.pop_front() else {
                break;
            };
            pending.spawn(run_stage(stage.clone(), image));
        }

        if exiting && pending.is_empty() {
            break;
        }

        tokio::select! {
            msg = rx.recv(), if !exiting => match msg {
                Some(WorkerMessage::Process(image)) => queue.push_back(image),
                Some(WorkerMessage::Exit) | None => {
                    debug!(queued = queue.len(), "Worker draining");
                    exiting = true;
                }
            },
            Some(joined) = pending.join_next(), if !pending.is_empty() => match joined {
                Ok(outcome) => (callback.lock().await)(outcome),
                Err(err) => error!("Worker task failed to join: {err}"),
            },
        }
    }

    debug!("Worker loop finished");
}

async fn run_stage(stage: Arc<ImageStage>, image: Image) -> WorkOutcome {
    let result = {
        let stage = stage.clone();
        let image = image.clone();
        tokio::task::spawn_blocking(move || stage.process(&image))
            .await
            .map_err(Error::from)
            .and_then(|result| result)
    };

    WorkOutcome { image, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::tissue_mask;
    use crate::model::{AtlasId, BatchId};
    use crate::stage::StageContext;
    use crate::test_utils::{brain, priors, Fixture};

    fn idle_stage(fixture: &Fixture) -> Arc<ImageStage> {
        let priors = priors();
        let mask = tissue_mask(&priors).unwrap();
        let context = StageContext {
            batch: BatchId::unique(),
            atlas: AtlasId::unique(),
            template: brain([0.0; 3], 1.0),
            priors,
            mask,
            downsample_factor: 1.0,
        };
        Arc::new(ImageStage::new(
            fixture.store.clone(),
            fixture.blobs.clone(),
            fixture.imaging.clone(),
            Arc::new(context),
        ))
    }

    #[tokio::test]
    async fn exit_is_sent_once() -> anyhow::Result<()> {
        let fixture = Fixture::new(1);
        let worker = Worker::new(idle_stage(&fixture), 1, |_outcome: WorkOutcome| {});

        assert!(worker.exit());
        assert!(!worker.exit());
        worker.join().await?;
        Ok(())
    }

    #[tokio::test]
    async fn join_after_drain_does_not_resend_exit() -> anyhow::Result<()> {
        let fixture = Fixture::new(1);
        let (tx, mut rx) = unbounded_channel::<WorkOutcome>();
        let worker = Worker::new(idle_stage(&fixture), 1, move |outcome: WorkOutcome| {
            let _ = tx.send(outcome);
        });

        worker.exit();
        // closes once the loop has returned and dropped the callback
        assert!(rx.recv().await.is_none());
        assert!(worker.tx.is_closed());
        assert!(!worker.exit());
        worker.join().await?;
        Ok(())
    }
}
