//! Cooperative, batching scheduler.
//!
//! Work is queued as jobs. Jobs request keys from [`Source`]s and suspend until the keys
//! are fetched; the scheduler runs every queued job as far as it can go before fetching the
//! accumulated keys of each source in one batch, then resumes the suspended jobs. Values
//! registered with [`Dataloader::lazy_at_depth`] are resumed shallowest first, once the
//! regular queues are empty.

mod lazy;
mod run;
mod source;

use std::any::Any;
use std::any::TypeId;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context as TaskContext;
use std::task::Poll;

use futures::future::LocalBoxFuture;
pub use lazy::Lazy;
pub use source::LoadResult;
pub use source::Source;
pub use source::SourceHandle;
use source::SourceEntry;

use crate::configuration::DataloaderConfig;
use crate::configuration::MIN_FIBER_LIMIT;
use crate::error::DataloaderError;

pub(crate) type Job = LocalBoxFuture<'static, Result<(), DataloaderError>>;

thread_local! {
    static PROGRESS: Cell<u64> = const { Cell::new(0) };
}

/// Notes that something happened which may let a suspended worker continue.
pub(crate) fn record_progress() {
    PROGRESS.with(|progress| progress.set(progress.get().wrapping_add(1)));
}

fn progress() -> u64 {
    PROGRESS.with(Cell::get)
}

/// Hands control back to the scheduler, which resumes the caller on its next pass.
///
/// Only meaningful from within a dataloader job.
pub async fn yield_now() {
    record_progress();
    suspend().await
}

/// Suspends without signaling progress: the caller is waiting on someone else.
pub(crate) fn suspend() -> Suspend {
    Suspend { suspended: false }
}

pub(crate) struct Suspend {
    suspended: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<()> {
        // the scheduler polls every suspended worker again, there is nothing to wake
        if self.suspended {
            Poll::Ready(())
        } else {
            self.suspended = true;
            Poll::Pending
        }
    }
}

/// Type-erased view of a source with pending keys.
pub(crate) trait PendingSource {
    fn run_pending_keys(self: Rc<Self>) -> Job;

    /// Sets the pending keys aside, returns whether there were any.
    fn stash_pending_keys(&self) -> bool;

    fn restore_pending_keys(&self);
}

struct CachedSource {
    typed: Rc<dyn Any>,
    pending: Rc<dyn PendingSource>,
}

struct Inner {
    fiber_limit: Option<usize>,
    nonblocking: bool,
    pending_jobs: RefCell<VecDeque<Job>>,
    pending_sources: RefCell<VecDeque<Rc<dyn PendingSource>>>,
    lazies_at_depth: RefCell<BTreeMap<usize, Vec<Job>>>,
    sources: RefCell<HashMap<(TypeId, String), CachedSource>>,
}

/// Everything queued outside of an isolated run.
struct Stash {
    jobs: VecDeque<Job>,
    sources: VecDeque<Rc<dyn PendingSource>>,
    lazies: BTreeMap<usize, Vec<Job>>,
    keys: Vec<Rc<dyn PendingSource>>,
}

/// The scheduler. Cheap to clone: clones share the same queues and sources.
#[derive(Clone)]
pub struct Dataloader {
    inner: Rc<Inner>,
}

impl Default for Dataloader {
    fn default() -> Self {
        Dataloader::from_parts(None, false)
    }
}

impl std::fmt::Debug for Dataloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataloader")
            .field("fiber_limit", &self.inner.fiber_limit)
            .field("nonblocking", &self.inner.nonblocking)
            .field("pending_jobs", &self.inner.pending_jobs.borrow().len())
            .field("pending_sources", &self.inner.pending_sources.borrow().len())
            .finish()
    }
}

impl Dataloader {
    pub fn new(config: &DataloaderConfig) -> Result<Self, DataloaderError> {
        if let Some(limit) = config.fiber_limit {
            if limit < MIN_FIBER_LIMIT {
                return Err(DataloaderError::FiberLimitTooLow { limit });
            }
        }
        Ok(Dataloader::from_parts(config.fiber_limit, config.nonblocking))
    }

    fn from_parts(fiber_limit: Option<usize>, nonblocking: bool) -> Self {
        Dataloader {
            inner: Rc::new(Inner {
                fiber_limit,
                nonblocking,
                pending_jobs: Default::default(),
                pending_sources: Default::default(),
                lazies_at_depth: Default::default(),
                sources: Default::default(),
            }),
        }
    }

    pub fn fiber_limit(&self) -> Option<usize> {
        self.inner.fiber_limit
    }

    pub fn nonblocking(&self) -> bool {
        self.inner.nonblocking
    }

    /// Queues `job` to run on the next pass of the scheduler.
    pub fn append_job<F>(&self, job: F)
    where
        F: Future<Output = Result<(), DataloaderError>> + 'static,
    {
        self.inner.pending_jobs.borrow_mut().push_back(Box::pin(job));
    }

    /// Queues `job` to run once no regular job is left, after every job queued at a smaller depth.
    pub fn lazy_at_depth<F>(&self, depth: usize, job: F)
    where
        F: Future<Output = Result<(), DataloaderError>> + 'static,
    {
        self.inner
            .lazies_at_depth
            .borrow_mut()
            .entry(depth)
            .or_default()
            .push(Box::pin(job));
    }

    /// The shared instance of `source` for this dataloader.
    ///
    /// Sources of the same type and [`Source::batch_key`] are the same instance, so their
    /// keys are fetched together and their results are cached together. When an instance
    /// already exists, `source` is dropped in favour of it.
    pub fn with<S: Source>(&self, source: S) -> SourceHandle<S> {
        let cache_key = (TypeId::of::<S>(), source.batch_key());
        if let Some(cached) = self.inner.sources.borrow().get(&cache_key) {
            if let Ok(entry) = cached.typed.clone().downcast::<SourceEntry<S>>() {
                return SourceHandle::from_entry(entry);
            }
        }
        let entry = Rc::new(SourceEntry::new(source, Rc::downgrade(&self.inner)));
        self.inner.sources.borrow_mut().insert(
            cache_key,
            CachedSource {
                typed: entry.clone(),
                pending: entry.clone(),
            },
        );
        SourceHandle::from_entry(entry)
    }

    /// Runs until every job, source and lazy value is done.
    ///
    /// In blocking mode this drives the workers on the current thread. With
    /// `nonblocking: true` it needs a tokio runtime: use [`Dataloader::run_async`].
    pub fn run(&self) -> Result<(), DataloaderError> {
        futures::executor::block_on(self.run_async())
    }

    #[tracing::instrument(skip_all, level = "trace")]
    pub async fn run_async(&self) -> Result<(), DataloaderError> {
        if self.inner.nonblocking && tokio::runtime::Handle::try_current().is_err() {
            return Err(DataloaderError::NonblockingWithoutRuntime);
        }
        run::Run::new(self).run().await
    }

    /// Runs `f` and everything it schedules to completion without touching work queued
    /// beforehand, which is restored afterwards.
    pub async fn run_isolated<F, Fut, T>(&self, f: F) -> Result<T, DataloaderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let stash = self.stash();
        let outcome = self.run_to_value(f()).await;
        self.restore(stash);
        outcome
    }

    /// Runs `f` with a fresh blocking dataloader and returns its output once all loading is done.
    pub fn with_dataloading<F, Fut, T>(f: F) -> Result<T, DataloaderError>
    where
        F: FnOnce(Dataloader) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let dataloader = Dataloader::default();
        let future = f(dataloader.clone());
        futures::executor::block_on(dataloader.run_to_value(future))
    }

    async fn run_to_value<Fut, T>(&self, future: Fut) -> Result<T, DataloaderError>
    where
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let output = slot.clone();
        self.append_job(async move {
            let value = future.await;
            *output.borrow_mut() = Some(value);
            Ok(())
        });
        self.run_async().await?;
        let value = slot.borrow_mut().take();
        value.ok_or(DataloaderError::Invariant {
            count: 1,
            queue: "pending jobs",
        })
    }

    fn stash(&self) -> Stash {
        let keys = self
            .inner
            .sources
            .borrow()
            .values()
            .filter(|cached| cached.pending.stash_pending_keys())
            .map(|cached| cached.pending.clone())
            .collect();
        Stash {
            jobs: std::mem::take(&mut *self.inner.pending_jobs.borrow_mut()),
            sources: std::mem::take(&mut *self.inner.pending_sources.borrow_mut()),
            lazies: std::mem::take(&mut *self.inner.lazies_at_depth.borrow_mut()),
            keys,
        }
    }

    fn restore(&self, stash: Stash) {
        let Stash {
            mut jobs,
            mut sources,
            mut lazies,
            keys,
        } = stash;
        for source in keys {
            source.restore_pending_keys();
        }
        {
            let mut pending_jobs = self.inner.pending_jobs.borrow_mut();
            jobs.extend(pending_jobs.drain(..));
            *pending_jobs = jobs;
        }
        {
            let mut pending_sources = self.inner.pending_sources.borrow_mut();
            sources.extend(pending_sources.drain(..));
            *pending_sources = sources;
        }
        let mut lazies_at_depth = self.inner.lazies_at_depth.borrow_mut();
        for (depth, jobs) in std::mem::take(&mut *lazies_at_depth) {
            lazies.entry(depth).or_default().extend(jobs);
        }
        *lazies_at_depth = lazies;
    }

    fn next_job(&self) -> Option<Job> {
        let job = self.inner.pending_jobs.borrow_mut().pop_front();
        if job.is_some() {
            record_progress();
        }
        job
    }

    fn next_source(&self) -> Option<Rc<dyn PendingSource>> {
        let source = self.inner.pending_sources.borrow_mut().pop_front();
        if source.is_some() {
            record_progress();
        }
        source
    }

    fn has_pending_jobs(&self) -> bool {
        !self.inner.pending_jobs.borrow().is_empty()
    }

    fn has_pending_sources(&self) -> bool {
        !self.inner.pending_sources.borrow().is_empty()
    }

    /// Moves the shallowest bucket of lazy jobs to the regular queue.
    fn resume_shallowest_lazies(&self) -> bool {
        let bucket = self.inner.lazies_at_depth.borrow_mut().pop_first();
        match bucket {
            Some((depth, jobs)) => {
                tracing::trace!(depth, jobs = jobs.len(), "resuming lazy values");
                record_progress();
                self.inner.pending_jobs.borrow_mut().extend(jobs);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use test_log::test;

    use super::*;
    use crate::error::BoxError;

    /// Doubles its keys and records every batch it is asked for.
    struct Doubler {
        batches: Rc<RefCell<Vec<Vec<i64>>>>,
    }

    #[async_trait(?Send)]
    impl Source for Doubler {
        type Key = i64;
        type Value = i64;

        async fn fetch(&self, keys: &[i64]) -> Result<Vec<i64>, BoxError> {
            self.batches.borrow_mut().push(keys.to_vec());
            Ok(keys.iter().map(|key| key * 2).collect())
        }
    }

    fn doubler(batches: &Rc<RefCell<Vec<Vec<i64>>>>) -> Doubler {
        Doubler {
            batches: batches.clone(),
        }
    }

    #[test]
    fn keys_requested_by_sibling_jobs_are_batched() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let results = Rc::new(RefCell::new(Vec::new()));
        let dataloader = Dataloader::default();
        for key in [1, 2, 1, 3] {
            let handle = dataloader.with(doubler(&batches));
            let results = results.clone();
            dataloader.append_job(async move {
                let value = handle.load(key).await.map_err(DataloaderError::job)?;
                results.borrow_mut().push(value);
                Ok(())
            });
        }
        dataloader.run().unwrap();

        assert_eq!(*batches.borrow(), vec![vec![1, 2, 3]]);
        assert_eq!(*results.borrow(), vec![2, 4, 2, 6]);
    }

    #[test]
    fn results_are_cached_across_runs() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let dataloader = Dataloader::default();
        let handle = dataloader.with(doubler(&batches));
        let first = handle.request(5);
        dataloader.run().unwrap();
        let second = dataloader.with(doubler(&batches)).request(5);

        assert_eq!(first.value().unwrap().unwrap(), 10);
        assert!(second.is_synced());
        assert_eq!(batches.borrow().len(), 1);
    }

    #[test]
    fn fiber_limit_must_allow_one_job_and_two_sources() {
        let error = Dataloader::new(&DataloaderConfig {
            fiber_limit: Some(2),
            nonblocking: false,
        })
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Dataloader fiber limit is too low (2), it must be at least 3"
        );
    }

    #[test]
    fn limited_fibers_still_finish_every_job() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let total = Rc::new(Cell::new(0));
        let dataloader = Dataloader::new(&DataloaderConfig {
            fiber_limit: Some(4),
            nonblocking: false,
        })
        .unwrap();
        for key in 0..10 {
            let handle = dataloader.with(doubler(&batches));
            let total = total.clone();
            dataloader.append_job(async move {
                let value = handle.load(key).await.map_err(DataloaderError::job)?;
                total.set(total.get() + value);
                Ok(())
            });
        }
        dataloader.run().unwrap();

        assert_eq!(total.get(), 90);
        let mut fetched: Vec<i64> = batches.borrow().iter().flatten().copied().collect();
        fetched.sort();
        assert_eq!(fetched, (0..10).collect::<Vec<_>>());
        // two job workers at most, so no batch can hold more than two keys
        assert!(batches.borrow().iter().all(|batch| batch.len() <= 2));
    }

    #[test]
    fn lazies_resume_shallowest_first() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let dataloader = Dataloader::default();
        for depth in [3, 1, 2, 1] {
            let order = order.clone();
            dataloader.lazy_at_depth(depth, async move {
                order.borrow_mut().push(depth);
                Ok(())
            });
        }
        let nested = dataloader.clone();
        let order_from_job = order.clone();
        dataloader.append_job(async move {
            order_from_job.borrow_mut().push(0);
            let order = order_from_job.clone();
            nested.lazy_at_depth(2, async move {
                order.borrow_mut().push(20);
                Ok(())
            });
            Ok(())
        });
        dataloader.run().unwrap();

        assert_eq!(*order.borrow(), vec![0, 1, 1, 2, 20, 3]);
    }

    #[test]
    fn failed_fetches_reach_every_key_of_the_batch() {
        struct Broken;

        #[async_trait(?Send)]
        impl Source for Broken {
            type Key = &'static str;
            type Value = String;

            async fn fetch(&self, _keys: &[&'static str]) -> Result<Vec<String>, BoxError> {
                Err("database is down".into())
            }
        }

        let outcome = Dataloader::with_dataloading(|dataloader| async move {
            dataloader.with(Broken).load_all(vec!["a", "b"]).await
        })
        .unwrap();
        assert_eq!(
            outcome.unwrap_err().to_string(),
            r#"Error from Broken#fetch("a", "b"), database is down"#
        );
    }

    #[test]
    fn short_fetches_abort_the_run() {
        struct Short;

        #[async_trait(?Send)]
        impl Source for Short {
            type Key = u8;
            type Value = u8;

            async fn fetch(&self, _keys: &[u8]) -> Result<Vec<u8>, BoxError> {
                Ok(vec![1])
            }
        }

        let error = Dataloader::with_dataloading(|dataloader| async move {
            dataloader.with(Short).load_all(vec![1, 2]).await
        })
        .unwrap_err();
        assert_eq!(error.to_string(), "Short#fetch returned 1 values for 2 keys");
    }

    #[test]
    fn waiting_on_a_value_nobody_provides_is_a_stall() {
        let error = Dataloader::with_dataloading(|_| async move {
            Lazy::<u8>::pending().sync().await
        })
        .unwrap_err();
        assert!(matches!(error, DataloaderError::Stalled { workers: 1 }));
    }

    #[test]
    fn isolated_runs_leave_queued_work_alone() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let ran = Rc::new(Cell::new(false));
        let dataloader = Dataloader::default();
        let outer = dataloader.with(doubler(&batches)).request(1);
        {
            let ran = ran.clone();
            dataloader.append_job(async move {
                ran.set(true);
                Ok(())
            });
        }

        let isolated = dataloader.clone();
        let handle = dataloader.with(doubler(&batches));
        let value = futures::executor::block_on(
            isolated.run_isolated(move || async move { handle.load(2).await }),
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, 4);
        assert!(!ran.get());
        assert!(!outer.is_synced());
        assert_eq!(*batches.borrow(), vec![vec![2]]);

        dataloader.run().unwrap();
        assert!(ran.get());
        assert_eq!(outer.value().unwrap().unwrap(), 2);
        assert_eq!(*batches.borrow(), vec![vec![2], vec![1]]);
    }

    #[test]
    fn isolated_runs_fetch_keys_requested_outside() {
        let batches = Rc::new(RefCell::new(Vec::new()));
        let dataloader = Dataloader::default();
        let outer = dataloader.with(doubler(&batches)).request(1);
        dataloader.with(doubler(&batches)).request(3);

        let isolated = dataloader.clone();
        let handle = dataloader.with(doubler(&batches));
        let value = futures::executor::block_on(
            isolated.run_isolated(move || async move { handle.load(1).await }),
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, 2);
        assert!(outer.is_synced());
        assert_eq!(*batches.borrow(), vec![vec![1]]);

        dataloader.run().unwrap();
        assert_eq!(*batches.borrow(), vec![vec![1], vec![3]]);
    }

    #[test]
    fn nonblocking_requires_a_runtime() {
        let dataloader = Dataloader::new(&DataloaderConfig {
            fiber_limit: None,
            nonblocking: true,
        })
        .unwrap();
        assert!(matches!(
            dataloader.run(),
            Err(DataloaderError::NonblockingWithoutRuntime)
        ));
    }

    #[tokio::test]
    async fn nonblocking_sources_may_await_io() {
        struct Slow;

        #[async_trait(?Send)]
        impl Source for Slow {
            type Key = u64;
            type Value = u64;

            async fn fetch(&self, keys: &[u64]) -> Result<Vec<u64>, BoxError> {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(keys.iter().map(|key| key + 1).collect())
            }
        }

        let dataloader = Dataloader::new(&DataloaderConfig {
            fiber_limit: None,
            nonblocking: true,
        })
        .unwrap();
        let values = Rc::new(RefCell::new(Vec::new()));
        for key in [10, 20] {
            let handle = dataloader.with(Slow);
            let values = values.clone();
            dataloader.append_job(async move {
                let value = handle.load(key).await.map_err(DataloaderError::job)?;
                values.borrow_mut().push(value);
                Ok(())
            });
        }
        dataloader.run_async().await.unwrap();
        assert_eq!(*values.borrow(), vec![11, 21]);
    }
}
