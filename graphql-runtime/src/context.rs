//! Per-query application context.
use std::cell::RefCell;
use std::rc::Rc;

use serde_json_bytes::ByteString;

use crate::dataloader::Dataloader;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// Values shared by every resolver of one query, plus the dataloader of its multiplex.
///
/// Cloning is cheap and clones share their entries.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Rc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    dataloader: Dataloader,
    entries: RefCell<Object>,
}

impl Context {
    pub fn new(dataloader: Dataloader) -> Self {
        Context::with_entries(dataloader, Object::new())
    }

    pub(crate) fn with_entries(dataloader: Dataloader, entries: Object) -> Self {
        Context {
            inner: Rc::new(ContextInner {
                dataloader,
                entries: RefCell::new(entries),
            }),
        }
    }

    pub fn dataloader(&self) -> &Dataloader {
        &self.inner.dataloader
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.entries.borrow().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.borrow().contains_key(key)
    }

    /// Returns the previous value of `key`, if any.
    pub fn insert(&self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.inner
            .entries
            .borrow_mut()
            .insert(ByteString::from(key), value.into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn clones_share_entries() {
        let context = Context::new(Dataloader::default());
        let clone = context.clone();
        assert_eq!(clone.insert("user", json!({ "id": 1 })), None);
        assert_eq!(context.get("user"), Some(json!({ "id": 1 })));
        assert!(context.contains_key("user"));
        assert!(!context.contains_key("locale"));
    }
}
