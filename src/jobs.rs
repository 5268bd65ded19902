use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::clients::Client;
use crate::errors::{AppError, AppResult};
use crate::locations::CandidateLocation;
use crate::pipeline::IngestionPipeline;

/// One unit of background work: a client's submitted restaurant list.
#[derive(Debug, Clone)]
pub struct AddRestaurantsJob {
    pub client: Client,
    pub restaurants: Vec<CandidateLocation>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// In-process work queue feeding a pool of ingestion workers.
pub struct IngestionQueue {
    sender: Option<UnboundedSender<AddRestaurantsJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestionQueue {
    /// Must be called from within a tokio runtime.
    pub fn spawn(pipeline: Arc<IngestionPipeline>, worker_count: usize, retry: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let workers = (0..worker_count.max(1))
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    Arc::clone(&receiver),
                    Arc::clone(&pipeline),
                    retry,
                ))
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn dispatch(&self, job: AddRestaurantsJob) -> AppResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| AppError::Queue("ingestion queue is shut down".into()))?;
        let client_id = job.client.id;
        let restaurants = job.restaurants.len();
        sender
            .send(job)
            .map_err(|_| AppError::Queue("ingestion workers are gone".into()))?;
        info!(target: "jobs", client_id, restaurants, "AddRestaurants job queued");
        Ok(())
    }

    /// Stops accepting jobs and waits until every queued job has run.
    pub async fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                error!(target: "jobs", ?err, "ingestion worker panicked");
            }
        }
    }
}

async fn work(
    worker: usize,
    receiver: Arc<AsyncMutex<UnboundedReceiver<AddRestaurantsJob>>>,
    pipeline: Arc<IngestionPipeline>,
    retry: RetryPolicy,
) {
    loop {
        let next = { receiver.lock().await.recv().await };
        let Some(job) = next else {
            break;
        };
        run_job(worker, &pipeline, &job, retry).await;
    }
}

async fn run_job(worker: usize, pipeline: &IngestionPipeline, job: &AddRestaurantsJob, retry: RetryPolicy) {
    info!(target: "jobs", worker, client_id = job.client.id, "job started: AddRestaurants");
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pipeline.run(&job.client, &job.restaurants, None).await {
            Ok(summary) => {
                info!(
                    target: "jobs",
                    worker,
                    client_id = job.client.id,
                    attempt,
                    inserted = summary.inserted,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "job completed: AddRestaurants"
                );
                return;
            }
            Err(err) if attempt < retry.max_attempts => {
                warn!(
                    target: "jobs",
                    worker,
                    client_id = job.client.id,
                    attempt,
                    error = %err,
                    "AddRestaurants run aborted; retrying after {:?}",
                    retry.delay
                );
                sleep(retry.delay).await;
            }
            Err(err) => {
                error!(
                    target: "jobs",
                    worker,
                    client_id = job.client.id,
                    attempt,
                    error = %err,
                    "AddRestaurants job failed permanently"
                );
                return;
            }
        }
    }
}
