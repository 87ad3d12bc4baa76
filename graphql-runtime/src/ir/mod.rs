//! Internal representation: the selections of a document, merged per concrete object type.
//!
//! Every field selection becomes a [`Node`] keyed by its owner type and response key.
//! Fragments are merged into the places they are spread, so a [`Node`] knows all the AST
//! fields contributing to it and, for each object type its value may have, the child
//! selections that apply.

mod rewrite;
mod scope;

use apollo_compiler::Name;
use apollo_compiler::ast;
use apollo_compiler::schema::FieldDefinition;
use indexmap::IndexMap;
pub(crate) use rewrite::rewrite;
pub use scope::Scope;

/// Index of a [`Node`] in its [`Document`].
pub type NodeId = usize;

/// One field selection on one concrete object type, or the root of a definition.
#[derive(Clone, Debug)]
pub struct Node {
    /// The response key, or the name of the definition for roots.
    pub name: String,
    /// The schema name of the field. Empty for roots.
    pub definition_name: String,
    /// The object type this selection is made on. For roots, the root type or the fragment's
    /// type condition.
    pub owner_type: Name,
    pub return_type: Option<ast::Type>,
    pub ast_nodes: Vec<apollo_compiler::Node<ast::Field>>,
    pub definitions: Vec<apollo_compiler::Node<FieldDefinition>>,
    pub directives: Vec<apollo_compiler::Node<ast::Directive>>,
    /// Child selections per possible object type of this field's value, by response key.
    pub typed_children: IndexMap<Name, IndexMap<String, NodeId>>,
    /// False when every contributing field or fragment was excluded by `@skip`/`@include`.
    pub included: bool,
    pub parent: Option<NodeId>,
}

impl Node {
    fn root(name: String, owner_type: Name) -> Self {
        Node {
            name,
            definition_name: String::new(),
            owner_type,
            return_type: None,
            ast_nodes: Vec::new(),
            definitions: Vec::new(),
            directives: Vec::new(),
            typed_children: IndexMap::new(),
            included: true,
            parent: None,
        }
    }

    /// The schema definition of this field, if any.
    pub fn definition(&self) -> Option<&apollo_compiler::Node<FieldDefinition>> {
        self.definitions.first()
    }

    /// The children selected when this field's value is a `type_name`.
    pub fn children_for(&self, type_name: &str) -> impl Iterator<Item = (&str, NodeId)> {
        self.typed_children
            .get(type_name)
            .into_iter()
            .flat_map(|children| children.iter().map(|(key, id)| (key.as_str(), *id)))
    }
}

/// The rewritten operations and fragments of a query document.
#[derive(Clone, Debug, Default)]
pub struct Document {
    nodes: Vec<Node>,
    /// Operation name (`None` when anonymous) to root node.
    pub operation_definitions: IndexMap<Option<Name>, NodeId>,
    pub fragment_definitions: IndexMap<Name, NodeId>,
}

impl Document {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The root of an operation, by name.
    pub fn operation(&self, name: Option<&str>) -> Option<NodeId> {
        self.operation_definitions
            .iter()
            .find(|(key, _)| key.as_ref().map(Name::as_str) == name)
            .map(|(_, id)| *id)
    }

    /// Every node below `root`, depth first.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut stack = vec![root];
        let mut visited = Vec::new();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            for children in node.typed_children.values().rev() {
                stack.extend(children.values().rev().copied());
            }
            if id != root {
                visited.push(id);
            }
        }
        visited
    }

    fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    fn child(&self, parent: NodeId, type_name: &str, key: &str) -> Option<NodeId> {
        self.nodes[parent]
            .typed_children
            .get(type_name)
            .and_then(|children| children.get(key))
            .copied()
    }

    fn insert_child(&mut self, parent: NodeId, type_name: Name, key: String, child: NodeId) {
        self.nodes[parent]
            .typed_children
            .entry(type_name)
            .or_default()
            .insert(key, child);
    }
}
