use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use async_trait::async_trait;

use super::record_progress;
use super::suspend;

/// Work a pending [`Lazy`] can drive while it waits for its value.
#[async_trait(?Send)]
pub(crate) trait Wait {
    async fn wait(&self);
}

enum State<T> {
    Pending {
        upstream: Option<Rc<dyn Wait>>,
        subscribers: Vec<Box<dyn FnOnce(&T)>>,
    },
    Synced(T),
}

/// A value which may not be available yet.
///
/// A `Lazy` is fulfilled exactly once; every later `fulfill` is ignored. Continuations
/// registered with [`Lazy::then`] run as soon as the value arrives, and [`Lazy::sync`]
/// suspends the current dataloader job until then.
pub struct Lazy<T: 'static> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Lazy {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Lazy<T> {
    /// An already synced value.
    pub fn ready(value: T) -> Self {
        Lazy {
            state: Rc::new(RefCell::new(State::Synced(value))),
        }
    }

    /// A value to be provided later with [`Lazy::fulfill`].
    pub fn pending() -> Self {
        Lazy {
            state: Rc::new(RefCell::new(State::Pending {
                upstream: None,
                subscribers: Vec::new(),
            })),
        }
    }

    fn with_upstream(upstream: Rc<dyn Wait>) -> Self {
        Lazy {
            state: Rc::new(RefCell::new(State::Pending {
                upstream: Some(upstream),
                subscribers: Vec::new(),
            })),
        }
    }

    fn from_weak(state: &Weak<RefCell<State<T>>>) -> Option<Self> {
        state.upgrade().map(|state| Lazy { state })
    }

    pub fn is_synced(&self) -> bool {
        matches!(&*self.state.borrow(), State::Synced(_))
    }

    /// The value, if it has arrived.
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            State::Synced(value) => Some(value.clone()),
            State::Pending { .. } => None,
        }
    }

    pub fn fulfill(&self, value: T) {
        let subscribers = {
            let mut state = self.state.borrow_mut();
            if matches!(&*state, State::Synced(_)) {
                return;
            }
            match std::mem::replace(&mut *state, State::Synced(value.clone())) {
                State::Pending { subscribers, .. } => subscribers,
                State::Synced(_) => Vec::new(),
            }
        };
        record_progress();
        for subscriber in subscribers {
            subscriber(&value);
        }
    }

    /// Resolves this value with the outcome of `other`.
    ///
    /// While `other` is pending, waiting on `self` waits on `other` directly, so chains of
    /// `then` never need to be walked link by link.
    pub fn fulfill_lazy(&self, other: Lazy<T>) {
        if let Some(value) = other.value() {
            self.fulfill(value);
            return;
        }
        {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Synced(_) => return,
                State::Pending { upstream, .. } => {
                    *upstream = Some(Rc::new(other.clone()));
                }
            }
        }
        let this = Rc::downgrade(&self.state);
        other.subscribe(move |value| {
            if let Some(this) = Lazy::from_weak(&this) {
                this.fulfill(value.clone());
            }
        });
    }

    fn subscribe(&self, subscriber: impl FnOnce(&T) + 'static) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Pending { subscribers, .. } => subscribers.push(Box::new(subscriber)),
            State::Synced(value) => {
                let value = value.clone();
                drop(state);
                subscriber(&value);
            }
        }
    }

    /// A new value computed from this one once it arrives.
    pub fn then<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Lazy<U> {
        if let Some(value) = self.value() {
            return Lazy::ready(f(value));
        }
        let next = Lazy::with_upstream(Rc::new(self.clone()));
        let weak = Rc::downgrade(&next.state);
        self.subscribe(move |value| {
            if let Some(next) = Lazy::from_weak(&weak) {
                next.fulfill(f(value.clone()));
            }
        });
        next
    }

    /// Like [`Lazy::then`], for continuations which are themselves deferred.
    pub fn and_then<U: Clone + 'static>(
        &self,
        f: impl FnOnce(T) -> Lazy<U> + 'static,
    ) -> Lazy<U> {
        if let Some(value) = self.value() {
            return f(value);
        }
        let next = Lazy::with_upstream(Rc::new(self.clone()));
        let weak = Rc::downgrade(&next.state);
        self.subscribe(move |value| {
            if let Some(next) = Lazy::from_weak(&weak) {
                next.fulfill_lazy(f(value.clone()));
            }
        });
        next
    }

    /// Collapses a list of deferred values into one deferred list, in the same order.
    pub fn all(members: Vec<Lazy<T>>) -> Lazy<Vec<T>> {
        let values: Option<Vec<T>> = members.iter().map(Lazy::value).collect();
        if let Some(values) = values {
            return Lazy::ready(values);
        }
        let siblings: Rc<Vec<_>> = Rc::new(
            members
                .iter()
                .map(|member| Rc::downgrade(&member.state))
                .collect(),
        );
        let remaining = Rc::new(Cell::new(members.len()));
        let result = Lazy::with_upstream(Rc::new(Group {
            members: members.clone(),
        }));
        let weak = Rc::downgrade(&result.state);
        for member in &members {
            let siblings = siblings.clone();
            let remaining = remaining.clone();
            let weak = weak.clone();
            member.subscribe(move |_| {
                remaining.set(remaining.get() - 1);
                if remaining.get() > 0 {
                    return;
                }
                let values: Option<Vec<T>> = siblings
                    .iter()
                    .map(|sibling| Lazy::from_weak(sibling).and_then(|sibling| sibling.value()))
                    .collect();
                if let (Some(result), Some(values)) = (Lazy::from_weak(&weak), values) {
                    result.fulfill(values);
                }
            });
        }
        result
    }

    /// Waits until the value arrives, driving whatever it depends on.
    pub async fn sync(&self) -> T {
        loop {
            let upstream = match &*self.state.borrow() {
                State::Synced(value) => return value.clone(),
                State::Pending { upstream, .. } => upstream.clone(),
            };
            match upstream {
                Some(upstream) => upstream.wait().await,
                None => suspend().await,
            }
        }
    }
}

#[async_trait(?Send)]
impl<T: Clone + 'static> Wait for Lazy<T> {
    async fn wait(&self) {
        let upstream = match &*self.state.borrow() {
            State::Pending {
                upstream: Some(upstream),
                ..
            } => Some(upstream.clone()),
            _ => None,
        };
        match upstream {
            Some(upstream) => upstream.wait().await,
            None => suspend().await,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            State::Synced(value) => f.debug_tuple("Lazy::Synced").field(value).finish(),
            State::Pending { subscribers, .. } => f
                .debug_struct("Lazy::Pending")
                .field("subscribers", &subscribers.len())
                .finish(),
        }
    }
}

struct Group<T: 'static> {
    members: Vec<Lazy<T>>,
}

#[async_trait(?Send)]
impl<T: Clone + 'static> Wait for Group<T> {
    async fn wait(&self) {
        for member in &self.members {
            member.sync().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;
    use test_log::test;

    use super::*;
    use crate::dataloader::Dataloader;

    #[test]
    fn fulfill_is_permanent() {
        let lazy = Lazy::pending();
        assert!(!lazy.is_synced());
        lazy.fulfill(1);
        lazy.fulfill(2);
        assert!(lazy.is_synced());
        assert_eq!(lazy.value(), Some(1));
    }

    #[test]
    fn then_runs_when_the_value_arrives() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let lazy = Lazy::pending();
        let doubled = lazy.then({
            let seen = seen.clone();
            move |value: i32| {
                seen.borrow_mut().push(value);
                value * 2
            }
        });
        let described = doubled.then(|value| format!("got {value}"));
        assert!(seen.borrow().is_empty());
        assert!(!described.is_synced());

        lazy.fulfill(21);
        assert_eq!(*seen.borrow(), vec![21]);
        assert_eq!(doubled.value(), Some(42));
        assert_eq!(described.value(), Some("got 42".to_string()));
    }

    #[test]
    fn fulfilling_with_a_pending_lazy_flattens() {
        let outer: Lazy<&str> = Lazy::pending();
        let inner = Lazy::pending();
        outer.fulfill_lazy(inner.clone());
        assert!(!outer.is_synced());
        inner.fulfill("done");
        assert_eq!(outer.value(), Some("done"));

        let chained = Lazy::ready(2).and_then(|value| Lazy::ready(value + 1));
        assert_eq!(chained.value(), Some(3));
    }

    #[test]
    fn all_waits_for_every_member() {
        let first = Lazy::pending();
        let second = Lazy::pending();
        let all = Lazy::all(vec![first.clone(), second.clone(), Lazy::ready(3)]);

        let values = Dataloader::with_dataloading(move |dataloader| async move {
            dataloader.append_job(async move {
                first.fulfill(1);
                second.fulfill(2);
                Ok(())
            });
            all.sync().await
        })
        .unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        assert_eq!(Lazy::<i32>::all(Vec::new()).value(), Some(Vec::new()));
    }
}
