//! The response tree being built by an execution.
//!
//! Objects and lists are stored in an arena so steps can write into them by id while other
//! steps are suspended. Every node knows its response path, so errors get their final path
//! (list indexes included) when they are recorded.
use indexmap::IndexMap;

use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;

pub(crate) type ResultId = usize;

/// What a position of the response holds.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Entry {
    Null,
    Leaf(Value),
    Object(ResultId),
    List(ResultId),
    /// An error was recorded here. Rendered as `null`.
    Error,
}

/// A position in the response: a key of an object or an item of a list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Place {
    Field { object: ResultId, key: String },
    Item { list: ResultId, index: usize },
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    non_null: bool,
}

#[derive(Debug)]
enum ResultNode {
    Object {
        path: Path,
        fields: IndexMap<String, Slot>,
    },
    List {
        path: Path,
        items: Vec<Entry>,
        item_non_null: bool,
    },
}

#[derive(Debug)]
pub(crate) struct ResultTree {
    nodes: Vec<ResultNode>,
}

impl ResultTree {
    /// A tree holding only the root object, whose id is returned too.
    pub(crate) fn new() -> (Self, ResultId) {
        let mut tree = ResultTree { nodes: Vec::new() };
        let root = tree.object(Path::empty());
        (tree, root)
    }

    pub(crate) fn object(&mut self, path: Path) -> ResultId {
        self.nodes.push(ResultNode::Object {
            path,
            fields: IndexMap::new(),
        });
        self.nodes.len() - 1
    }

    pub(crate) fn list(&mut self, path: Path, len: usize, item_non_null: bool) -> ResultId {
        self.nodes.push(ResultNode::List {
            path,
            items: vec![Entry::Null; len],
            item_non_null,
        });
        self.nodes.len() - 1
    }

    /// Adds `key` to `object` if it is not there yet, so keys keep the order of the selections.
    pub(crate) fn reserve(&mut self, object: ResultId, key: &str) {
        if let Some(ResultNode::Object { fields, .. }) = self.nodes.get_mut(object) {
            fields.entry(key.to_string()).or_insert(Slot {
                entry: Entry::Null,
                non_null: false,
            });
        }
    }

    /// Writes `entry` at `place`. `non_null` is the nullability of a field position, list
    /// items take the nullability given when the list was created.
    pub(crate) fn set(&mut self, place: &Place, entry: Entry, non_null: bool) {
        match place {
            Place::Field { object, key } => {
                if let Some(ResultNode::Object { fields, .. }) = self.nodes.get_mut(*object) {
                    fields.insert(key.clone(), Slot { entry, non_null });
                }
            }
            Place::Item { list, index } => {
                if let Some(ResultNode::List { items, .. }) = self.nodes.get_mut(*list)
                    && let Some(item) = items.get_mut(*index)
                {
                    *item = entry;
                }
            }
        }
    }

    /// The response path of `place`.
    pub(crate) fn path(&self, place: &Place) -> Path {
        match place {
            Place::Field { object, key } => self.node_path(*object).join(key.as_str()),
            Place::Item { list, index } => self.node_path(*list).join(*index),
        }
    }

    fn node_path(&self, id: ResultId) -> Path {
        match self.nodes.get(id) {
            Some(ResultNode::Object { path, .. } | ResultNode::List { path, .. }) => path.clone(),
            None => Path::empty(),
        }
    }

    fn entry(&self, place: &Place) -> Option<&Entry> {
        match (place, self.nodes.get(place_node(place))) {
            (Place::Field { key, .. }, Some(ResultNode::Object { fields, .. })) => {
                fields.get(key).map(|slot| &slot.entry)
            }
            (Place::Item { index, .. }, Some(ResultNode::List { items, .. })) => items.get(*index),
            _ => None,
        }
    }

    fn is_non_null(&self, place: &Place) -> bool {
        match (place, self.nodes.get(place_node(place))) {
            (Place::Field { key, .. }, Some(ResultNode::Object { fields, .. })) => {
                fields.get(key).is_some_and(|slot| slot.non_null)
            }
            (Place::Item { .. }, Some(ResultNode::List { item_non_null, .. })) => *item_non_null,
            _ => false,
        }
    }

    fn replace(&mut self, place: &Place, entry: Entry) {
        let non_null = self.is_non_null(place);
        self.set(place, entry, non_null);
    }

    /// Bubbles the nulls left by errors up to their nearest nullable ancestor.
    ///
    /// Only the given error paths are walked. Returns `false` when a null reached the root,
    /// in which case the whole `data` is null.
    pub(crate) fn propagate_errors(&mut self, root: ResultId, error_paths: &[Path]) -> bool {
        for error_path in error_paths {
            let Some(places) = self.places_along(root, error_path) else {
                continue;
            };
            let mut depth = places.len();
            while depth > 0 {
                let place = &places[depth - 1];
                if matches!(self.entry(place), Some(Entry::Error)) {
                    self.replace(place, Entry::Null);
                }
                if !matches!(self.entry(place), Some(Entry::Null)) || !self.is_non_null(place) {
                    break;
                }
                if depth == 1 {
                    tracing::debug!(path = %error_path, "null propagated to the root");
                    return false;
                }
                self.replace(&places[depth - 2], Entry::Null);
                depth -= 1;
            }
        }
        true
    }

    /// The places from the root down to `path`, or `None` if an ancestor was already nulled.
    fn places_along(&self, root: ResultId, path: &Path) -> Option<Vec<Place>> {
        let mut places = Vec::with_capacity(path.len());
        let mut current = Entry::Object(root);
        for element in path.iter() {
            let place = match (current, element) {
                (Entry::Object(object), PathElement::Key(key)) => Place::Field {
                    object,
                    key: key.clone(),
                },
                (Entry::List(list), PathElement::Index(index)) => Place::Item {
                    list,
                    index: *index,
                },
                _ => return None,
            };
            current = self.entry(&place)?.clone();
            places.push(place);
        }
        Some(places)
    }

    /// Renders the node `id` as JSON.
    pub(crate) fn to_value(&self, id: ResultId) -> Value {
        match self.nodes.get(id) {
            Some(ResultNode::Object { fields, .. }) => Value::Object(
                fields
                    .iter()
                    .map(|(key, slot)| (key.as_str().into(), self.render(&slot.entry)))
                    .collect::<Object>(),
            ),
            Some(ResultNode::List { items, .. }) => {
                Value::Array(items.iter().map(|item| self.render(item)).collect())
            }
            None => Value::Null,
        }
    }

    fn render(&self, entry: &Entry) -> Value {
        match entry {
            Entry::Null | Entry::Error => Value::Null,
            Entry::Leaf(value) => value.clone(),
            Entry::Object(id) | Entry::List(id) => self.to_value(*id),
        }
    }
}

fn place_node(place: &Place) -> ResultId {
    match place {
        Place::Field { object, .. } => *object,
        Place::Item { list, .. } => *list,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn field(object: ResultId, key: &str) -> Place {
        Place::Field {
            object,
            key: key.to_string(),
        }
    }

    /// `{ a: { items: [{ req }, { req }] } }` with the second `req` failed.
    fn failed_item(list_non_null: bool, item_non_null: bool) -> (ResultTree, ResultId, Path) {
        let (mut tree, root) = ResultTree::new();
        let a = tree.object(Path::from(vec!["a"]));
        tree.set(&field(root, "a"), Entry::Object(a), false);
        let items = tree.list(Path::from(vec!["a", "items"]), 2, item_non_null);
        tree.set(&field(a, "items"), Entry::List(items), list_non_null);
        for index in 0..2 {
            let place = Place::Item { list: items, index };
            let item = tree.object(tree.path(&place));
            tree.set(&place, Entry::Object(item), false);
            let req = field(item, "req");
            if index == 0 {
                tree.set(&req, Entry::Leaf(json!("yes")), true);
            } else {
                tree.set(&req, Entry::Error, true);
            }
        }
        let error_path = Path::from(vec!["a", "items"]).join(1).join("req");
        (tree, root, error_path)
    }

    #[test]
    fn keys_keep_their_reserved_order() {
        let (mut tree, root) = ResultTree::new();
        tree.reserve(root, "b");
        tree.reserve(root, "a");
        tree.set(&field(root, "a"), Entry::Leaf(json!(1)), false);
        tree.reserve(root, "b");
        assert_eq!(tree.to_value(root), json!({ "b": null, "a": 1 }));
    }

    #[test]
    fn nulls_stop_at_nullable_items() {
        let (mut tree, root, error_path) = failed_item(false, false);
        // root, a, the list, then its two items
        assert_eq!(
            tree.path(&field(3, "req")),
            Path::from(vec!["a", "items"]).join(0).join("req")
        );
        assert!(tree.propagate_errors(root, &[error_path]));
        assert_eq!(
            tree.to_value(root),
            json!({ "a": { "items": [{ "req": "yes" }, null] } })
        );
    }

    #[test]
    fn nulls_bubble_through_non_null_items() {
        let (mut tree, root, error_path) = failed_item(false, true);
        assert!(tree.propagate_errors(root, &[error_path]));
        assert_eq!(tree.to_value(root), json!({ "a": { "items": null } }));
    }

    #[test]
    fn nulls_may_reach_the_root() {
        let (mut tree, root, error_path) = failed_item(true, true);
        tree.set(&field(root, "a"), Entry::Object(1), true);
        assert!(!tree.propagate_errors(root, &[error_path.clone(), error_path]));
    }
}
