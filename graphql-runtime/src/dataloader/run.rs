use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context as TaskContext;
use std::task::Poll;
use std::task::Waker;

use futures::task::ArcWake;
use futures::task::AtomicWaker;
use tracing::error;
use tracing::trace;

use super::Dataloader;
use super::Job;
use super::progress;
use super::record_progress;
use crate::error::DataloaderError;

/// Set by whatever wakes a worker in nonblocking mode, so an idle scheduler knows when to
/// look at its workers again.
#[derive(Default)]
struct Signal {
    woken: AtomicBool,
    waker: AtomicWaker,
}

impl ArcWake for Signal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        arc_self.waker.wake();
    }
}

impl Signal {
    async fn wait(&self) {
        futures::future::poll_fn(|cx| {
            if self.woken.swap(false, Ordering::SeqCst) {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            if self.woken.swap(false, Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

#[derive(Clone, Copy)]
enum Queue {
    Jobs,
    Sources,
}

/// One call to [`Dataloader::run_async`].
///
/// Workers are resumed in rounds:
///  * resume the workers suspended in the previous round,
///  * start new workers while jobs are pending, keeping two slots free for sources,
///  * fetch every pending source, including sources that became pending while fetching,
///  * queue the workers that suspended again for the next round.
///
/// Once no job is left, the shallowest bucket of lazy jobs is queued and the rounds start over.
pub(super) struct Run<'a> {
    dataloader: &'a Dataloader,
    total_fiber_limit: usize,
    jobs_fiber_limit: usize,
    signal: Option<Arc<Signal>>,
    waker: Waker,
    pending_job_workers: VecDeque<Job>,
    next_job_workers: Vec<Job>,
    pending_source_workers: VecDeque<Job>,
    next_source_workers: Vec<Job>,
}

impl<'a> Run<'a> {
    pub(super) fn new(dataloader: &'a Dataloader) -> Self {
        let total_fiber_limit = dataloader.fiber_limit().unwrap_or(usize::MAX);
        let signal = dataloader
            .nonblocking()
            .then(|| Arc::new(Signal::default()));
        let waker = match &signal {
            Some(signal) => futures::task::waker(signal.clone()),
            None => futures::task::noop_waker(),
        };
        Run {
            dataloader,
            total_fiber_limit,
            jobs_fiber_limit: total_fiber_limit.saturating_sub(2),
            signal,
            waker,
            pending_job_workers: VecDeque::new(),
            next_job_workers: Vec::new(),
            pending_source_workers: VecDeque::new(),
            next_source_workers: Vec::new(),
        }
    }

    fn fiber_count(&self) -> usize {
        self.pending_job_workers.len()
            + self.next_job_workers.len()
            + self.pending_source_workers.len()
            + self.next_source_workers.len()
    }

    pub(super) async fn run(mut self) -> Result<(), DataloaderError> {
        loop {
            self.run_jobs().await?;
            if self.dataloader.has_pending_jobs() {
                continue;
            }
            if !self.dataloader.resume_shallowest_lazies() {
                break;
            }
        }
        self.check_invariants()
    }

    async fn run_jobs(&mut self) -> Result<(), DataloaderError> {
        let mut last_progress = None;
        let mut first_pass = true;
        loop {
            if first_pass {
                first_pass = false;
            } else {
                match self.pending_job_workers.pop_front() {
                    Some(worker) => self.resume_once(worker, Queue::Jobs)?,
                    None => break,
                }
            }

            while self.dataloader.has_pending_jobs() && self.fiber_count() < self.jobs_fiber_limit
            {
                let worker = self.spawn_job_worker();
                self.resume_once(worker, Queue::Jobs)?;
            }

            if self.pending_job_workers.is_empty()
                || self.fiber_count() >= self.jobs_fiber_limit
            {
                self.run_sources().await?;
                self.join_queues(Queue::Jobs, &mut last_progress).await?;
            }
        }
        Ok(())
    }

    async fn run_sources(&mut self) -> Result<(), DataloaderError> {
        let mut last_progress = None;
        let mut first_pass = true;
        loop {
            if first_pass {
                first_pass = false;
            } else {
                match self.pending_source_workers.pop_front() {
                    Some(worker) => self.resume_once(worker, Queue::Sources)?,
                    None => break,
                }
            }

            while self.dataloader.has_pending_sources()
                && self.fiber_count() < self.total_fiber_limit
            {
                let worker = self.spawn_source_worker();
                self.resume_once(worker, Queue::Sources)?;
            }

            if self.pending_source_workers.is_empty()
                || self.fiber_count() >= self.total_fiber_limit
            {
                self.join_queues(Queue::Sources, &mut last_progress).await?;
            }
        }
        Ok(())
    }

    fn spawn_job_worker(&self) -> Job {
        let dataloader = self.dataloader.clone();
        Box::pin(async move {
            while let Some(job) = dataloader.next_job() {
                job.await?;
            }
            Ok(())
        })
    }

    fn spawn_source_worker(&self) -> Job {
        let dataloader = self.dataloader.clone();
        Box::pin(async move {
            while let Some(source) = dataloader.next_source() {
                source.run_pending_keys().await?;
            }
            Ok(())
        })
    }

    fn resume_once(&mut self, mut worker: Job, queue: Queue) -> Result<(), DataloaderError> {
        let mut cx = TaskContext::from_waker(&self.waker);
        match worker.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(())) => {
                record_progress();
                Ok(())
            }
            Poll::Ready(Err(error)) => Err(error),
            Poll::Pending => {
                match queue {
                    Queue::Jobs => self.next_job_workers.push(worker),
                    Queue::Sources => self.next_source_workers.push(worker),
                }
                Ok(())
            }
        }
    }

    /// Moves the workers suspended during this round to the queue of the next one.
    async fn join_queues(
        &mut self,
        queue: Queue,
        last_progress: &mut Option<u64>,
    ) -> Result<(), DataloaderError> {
        let waiting = match queue {
            Queue::Jobs => self.next_job_workers.len(),
            Queue::Sources => self.next_source_workers.len(),
        };
        let current = progress();
        let idle = waiting > 0 && *last_progress == Some(current);
        *last_progress = Some(current);

        match &self.signal {
            Some(signal) => {
                tokio::task::yield_now().await;
                if idle {
                    trace!(waiting, "waiting for a worker to be woken");
                    signal.wait().await;
                }
            }
            None if idle => {
                let workers = self.fiber_count();
                error!(workers, "dataloader stalled");
                return Err(DataloaderError::Stalled { workers });
            }
            None => {}
        }

        match queue {
            Queue::Jobs => self.pending_job_workers.extend(self.next_job_workers.drain(..)),
            Queue::Sources => self
                .pending_source_workers
                .extend(self.next_source_workers.drain(..)),
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), DataloaderError> {
        let queues = [
            (
                self.dataloader.inner.pending_jobs.borrow().len(),
                "pending jobs",
            ),
            (self.pending_job_workers.len(), "pending fibers"),
            (self.next_job_workers.len(), "next fibers"),
            (
                self.dataloader.inner.pending_sources.borrow().len(),
                "pending sources",
            ),
            (self.pending_source_workers.len(), "pending source fibers"),
            (self.next_source_workers.len(), "next source fibers"),
        ];
        match queues.into_iter().find(|(count, _)| *count > 0) {
            Some((count, queue)) => {
                error!(count, queue, "dataloader finished with work left");
                Err(DataloaderError::Invariant { count, queue })
            }
            None => Ok(()),
        }
    }
}
