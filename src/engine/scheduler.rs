//! Scheduler: runs every registered pipeline on its own interval.

use super::pipeline::Pipeline;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Runs pipelines until shut down. Clones share the same shutdown signal.
#[derive(Clone)]
pub struct Scheduler {
    pipelines: Arc<Mutex<Vec<(Pipeline, Duration)>>>,
    shutdown: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pipelines: Arc::new(Mutex::new(Vec::new())),
            shutdown,
        }
    }

    /// Register a pipeline to tick every `interval`. Takes effect on the
    /// next call to [`Scheduler::run`].
    pub fn add(&self, pipeline: Pipeline, interval: Duration) {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        pipelines.push((pipeline, interval));
    }

    /// Signal every loop to stop. Ticks already running finish first.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until [`Scheduler::shutdown`] is called.
    ///
    /// Ticks are spawned, so a tick that outlasts its interval overlaps the
    /// next one; the phase guards decide what the later tick may do.
    pub async fn run(&self) {
        let pipelines = self
            .pipelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        info!(workflows = pipelines.len(), "scheduler started");

        let mut loops = JoinSet::new();
        for (pipeline, interval) in pipelines {
            loops.spawn(run_loop(pipeline, interval, self.shutdown.subscribe()));
        }
        while loops.join_next().await.is_some() {}

        info!("scheduler stopped");
    }
}

async fn run_loop(pipeline: Pipeline, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut running = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = interval.tick() => {
                let pipeline = pipeline.clone();
                running.spawn(async move {
                    if let Err(e) = pipeline.tick().await {
                        error!(workflow = %pipeline.workflow(), "tick failed: {e}");
                    }
                });
            }
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }

    info!(workflow = %pipeline.workflow(), running = running.len(), "workflow loop stopping");
    while running.join_next().await.is_some() {}
}
