use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::rc::Weak;

use async_trait::async_trait;
use indexmap::IndexSet;

use super::Inner;
use super::Job;
use super::Lazy;
use super::PendingSource;
use super::record_progress;
use crate::error::BoxError;
use crate::error::DataloaderError;
use crate::error::LoadError;

/// What a key of a [`Source`] resolves to.
pub type LoadResult<V> = Result<V, LoadError>;

/// A batch loader.
///
/// Keys requested through a [`SourceHandle`] accumulate until the dataloader has nothing
/// else to run, then they are handed to [`Source::fetch`] in a single call.
#[async_trait(?Send)]
pub trait Source: 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + 'static;
    type Value: Clone + 'static;

    /// Distinguishes instances of the same source type which must not share batches,
    /// like a loader per table.
    fn batch_key(&self) -> String {
        String::new()
    }

    /// Used in error messages.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        let path = full.split('<').next().unwrap_or(full);
        path.rsplit("::").next().unwrap_or(path).to_string()
    }

    /// One value per key, in the order of `keys`.
    async fn fetch(&self, keys: &[Self::Key]) -> Result<Vec<Self::Value>, BoxError>;
}

pub(super) struct SourceEntry<S: Source> {
    source: S,
    dataloader: Weak<Inner>,
    pending_keys: RefCell<IndexSet<S::Key>>,
    /// Keys set aside by isolated runs, innermost run last.
    stashed_keys: RefCell<Vec<IndexSet<S::Key>>>,
    results: RefCell<HashMap<S::Key, Lazy<LoadResult<S::Value>>>>,
    enqueued: Cell<bool>,
}

impl<S: Source> SourceEntry<S> {
    pub(super) fn new(source: S, dataloader: Weak<Inner>) -> Self {
        SourceEntry {
            source,
            dataloader,
            pending_keys: Default::default(),
            stashed_keys: Default::default(),
            results: Default::default(),
            enqueued: Cell::new(false),
        }
    }

    fn enqueue(self: &Rc<Self>) {
        if self.enqueued.replace(true) {
            return;
        }
        if let Some(dataloader) = self.dataloader.upgrade() {
            dataloader
                .pending_sources
                .borrow_mut()
                .push_back(self.clone());
        }
    }

    /// Takes `key` back from the keys set aside by isolated runs.
    fn unstash(&self, key: &S::Key) -> bool {
        self.stashed_keys
            .borrow_mut()
            .iter_mut()
            .any(|keys| keys.shift_remove(key))
    }
}

impl<S: Source> PendingSource for SourceEntry<S> {
    fn run_pending_keys(self: Rc<Self>) -> Job {
        Box::pin(async move {
            self.enqueued.set(false);
            let keys: Vec<S::Key> = std::mem::take(&mut *self.pending_keys.borrow_mut())
                .into_iter()
                .collect();
            if keys.is_empty() {
                return Ok(());
            }
            record_progress();
            let source_name = self.source.name();
            tracing::debug!(source = %source_name, keys = keys.len(), "fetching batch");

            let outcome = self.source.fetch(&keys).await;
            let lazies: Vec<Option<Lazy<LoadResult<S::Value>>>> = {
                let results = self.results.borrow();
                keys.iter().map(|key| results.get(key).cloned()).collect()
            };
            match outcome {
                Ok(values) if values.len() == keys.len() => {
                    for (lazy, value) in lazies.into_iter().zip(values) {
                        if let Some(lazy) = lazy {
                            lazy.fulfill(Ok(value));
                        }
                    }
                    Ok(())
                }
                Ok(values) => {
                    tracing::error!(
                        source = %source_name,
                        keys = keys.len(),
                        values = values.len(),
                        "fetch returned the wrong number of values"
                    );
                    Err(DataloaderError::MissingValues {
                        source_name,
                        keys: keys.len(),
                        values: values.len(),
                    })
                }
                Err(cause) => {
                    tracing::debug!(source = %source_name, error = %cause, "fetch failed");
                    let error = LoadError::new(&source_name, &keys, cause);
                    for lazy in lazies.into_iter().flatten() {
                        lazy.fulfill(Err(error.clone()));
                    }
                    Ok(())
                }
            }
        })
    }

    fn stash_pending_keys(&self) -> bool {
        if self.pending_keys.borrow().is_empty() {
            return false;
        }
        self.enqueued.set(false);
        let keys = std::mem::take(&mut *self.pending_keys.borrow_mut());
        self.stashed_keys.borrow_mut().push(keys);
        true
    }

    fn restore_pending_keys(&self) {
        let Some(keys) = self.stashed_keys.borrow_mut().pop() else {
            return;
        };
        let results = self.results.borrow();
        // keys fetched by the isolated run are done
        let keys = keys
            .into_iter()
            .filter(|key| results.get(key).is_some_and(|lazy| !lazy.is_synced()));
        self.pending_keys.borrow_mut().extend(keys);
        self.enqueued.set(true);
    }
}

/// Requests keys from the dataloader's shared instance of a [`Source`].
pub struct SourceHandle<S: Source> {
    entry: Rc<SourceEntry<S>>,
}

impl<S: Source> Clone for SourceHandle<S> {
    fn clone(&self) -> Self {
        SourceHandle {
            entry: self.entry.clone(),
        }
    }
}

impl<S: Source> SourceHandle<S> {
    pub(super) fn from_entry(entry: Rc<SourceEntry<S>>) -> Self {
        SourceHandle { entry }
    }

    pub fn source(&self) -> &S {
        &self.entry.source
    }

    /// The value of `key`, fetched with the next batch unless it is already known.
    pub fn request(&self, key: S::Key) -> Lazy<LoadResult<S::Value>> {
        if let Some(lazy) = self.entry.results.borrow().get(&key) {
            // requested outside of the current isolated run, fetch it within it
            if !lazy.is_synced() && self.entry.unstash(&key) {
                self.entry.pending_keys.borrow_mut().insert(key);
                self.entry.enqueue();
            }
            return lazy.clone();
        }
        let lazy = Lazy::pending();
        self.entry
            .results
            .borrow_mut()
            .insert(key.clone(), lazy.clone());
        self.entry.pending_keys.borrow_mut().insert(key);
        self.entry.enqueue();
        lazy
    }

    pub fn request_all(&self, keys: Vec<S::Key>) -> Lazy<Vec<LoadResult<S::Value>>> {
        Lazy::all(keys.into_iter().map(|key| self.request(key)).collect())
    }

    pub async fn load(&self, key: S::Key) -> LoadResult<S::Value> {
        self.request(key).sync().await
    }

    /// Every value, or the first error among them.
    pub async fn load_all(&self, keys: Vec<S::Key>) -> LoadResult<Vec<S::Value>> {
        let requests: Vec<_> = keys.into_iter().map(|key| self.request(key)).collect();
        let mut values = Vec::with_capacity(requests.len());
        for request in requests {
            values.push(request.sync().await?);
        }
        Ok(values)
    }

    /// Whether `key` has been fetched already.
    pub fn is_loaded(&self, key: &S::Key) -> bool {
        self.entry
            .results
            .borrow()
            .get(key)
            .is_some_and(Lazy::is_synced)
    }

    /// Seeds the cache with a value obtained elsewhere. Known keys keep their value.
    pub fn prime(&self, key: S::Key, value: S::Value) {
        let lazy = self
            .entry
            .results
            .borrow_mut()
            .entry(key)
            .or_insert_with(Lazy::pending)
            .clone();
        lazy.fulfill(Ok(value));
    }
}
