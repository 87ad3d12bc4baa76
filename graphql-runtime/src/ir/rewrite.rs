use std::collections::HashMap;

use apollo_compiler::Name;
use apollo_compiler::ast;
use apollo_compiler::parser::SourceMap;
use indexmap::IndexMap;
use itertools::Itertools;

use super::Document;
use super::Node;
use super::NodeId;
use super::Scope;
use crate::error::ExecutionError;
use crate::error::ValidationError;
use crate::graphql::Location;
use crate::json_ext::Object;
use crate::query::directives_include;
use crate::schema::Schema;
use crate::type_environment::TypeEnvironment;

/// The definition a fragment spread appears in.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Owner {
    Operation,
    Fragment(Name),
}

/// A fragment spread waiting for its fragment to be complete.
struct Spread {
    owner: Owner,
    fragment: Name,
    /// The nodes the fragment's selections are merged into.
    parents: Vec<NodeId>,
    scope: Scope,
    included: bool,
    node: apollo_compiler::Node<ast::FragmentSpread>,
}

struct Rewrite<'a> {
    schema: &'a Schema,
    sources: &'a SourceMap,
    variables: &'a Object,
    env: TypeEnvironment,
    document: Document,
    spreads: Vec<Spread>,
    fragment_locations: HashMap<Name, Vec<Location>>,
    errors: Vec<ValidationError>,
}

/// Builds the internal representation of `document`.
///
/// Static errors (undefined fields and fragments, fragment cycles, field and argument
/// conflicts) are returned next to the document. Only a bug in fragment resolution is
/// an `Err`.
pub(crate) fn rewrite(
    schema: &Schema,
    document: &ast::Document,
    variables: &Object,
) -> Result<(Document, Vec<ValidationError>), ExecutionError> {
    let mut rewrite = Rewrite {
        schema,
        sources: &document.sources,
        variables,
        env: TypeEnvironment::new(schema),
        document: Document::default(),
        spreads: Vec::new(),
        fragment_locations: HashMap::new(),
        errors: Vec::new(),
    };
    for definition in &document.definitions {
        match definition {
            ast::Definition::OperationDefinition(operation) => rewrite.visit_operation(operation),
            ast::Definition::FragmentDefinition(fragment) => rewrite.visit_fragment(fragment),
            _ => {}
        }
    }
    rewrite.resolve_fragments()?;
    rewrite.check_conflicts();
    Ok((rewrite.document, rewrite.errors))
}

impl Rewrite<'_> {
    fn locations<T>(&self, nodes: &[apollo_compiler::Node<T>]) -> Vec<Location> {
        nodes
            .iter()
            .filter_map(|node| Location::from_node(node, self.sources))
            .collect()
    }

    fn visit_operation(&mut self, operation: &apollo_compiler::Node<ast::OperationDefinition>) {
        let Some(root_type) = self.schema.root_type(operation.operation_type).cloned() else {
            return;
        };
        let name = operation
            .name
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let root = self.document.add(Node::root(name, root_type.clone()));
        self.document
            .operation_definitions
            .insert(operation.name.clone(), root);

        let scope = Scope::of(self.schema, &root_type);
        self.env.enter_operation(operation.operation_type);
        self.visit_selection_set(
            &operation.selection_set,
            &[root],
            &scope,
            true,
            &Owner::Operation,
        );
        self.env.leave_type_condition();
    }

    fn visit_fragment(&mut self, fragment: &apollo_compiler::Node<ast::FragmentDefinition>) {
        let type_condition = &fragment.type_condition;
        let root = self.document.add(Node::root(
            fragment.name.to_string(),
            type_condition.clone(),
        ));
        self.document
            .fragment_definitions
            .insert(fragment.name.clone(), root);
        let locations = self.locations(std::slice::from_ref(fragment));
        self.fragment_locations
            .insert(fragment.name.clone(), locations);

        let scope = Scope::of(self.schema, type_condition);
        self.env.enter_type_condition(Some(type_condition));
        self.visit_selection_set(
            &fragment.selection_set,
            &[root],
            &scope,
            true,
            &Owner::Fragment(fragment.name.clone()),
        );
        self.env.leave_type_condition();
    }

    fn visit_selection_set(
        &mut self,
        selections: &[ast::Selection],
        parents: &[NodeId],
        scope: &Scope,
        included: bool,
        owner: &Owner,
    ) {
        for selection in selections {
            match selection {
                ast::Selection::Field(field) => {
                    self.visit_field(field, parents, scope, included, owner)
                }
                ast::Selection::InlineFragment(inline) => {
                    let included =
                        included && directives_include(&inline.directives, self.variables);
                    let scope = scope.enter(self.schema, inline.type_condition.as_deref());
                    self.env
                        .enter_type_condition(inline.type_condition.as_ref());
                    self.visit_selection_set(
                        &inline.selection_set,
                        parents,
                        &scope,
                        included,
                        owner,
                    );
                    self.env.leave_type_condition();
                }
                ast::Selection::FragmentSpread(spread) => self.spreads.push(Spread {
                    owner: owner.clone(),
                    fragment: spread.fragment_name.clone(),
                    parents: parents.to_vec(),
                    scope: scope.clone(),
                    included: included && directives_include(&spread.directives, self.variables),
                    node: spread.clone(),
                }),
            }
        }
    }

    fn visit_field(
        &mut self,
        field: &apollo_compiler::Node<ast::Field>,
        parents: &[NodeId],
        scope: &Scope,
        included: bool,
        owner: &Owner,
    ) {
        let schema = self.schema;
        let key = field.alias.as_ref().unwrap_or(&field.name).to_string();
        let included = included && directives_include(&field.directives, self.variables);

        self.env.enter_field(&field.name);
        let child_scope = match self.env.current_field_definition() {
            Some(definition) => Scope::of(schema, definition.ty.inner_named_type()),
            None => {
                self.report_undefined_field(field);
                Scope::default()
            }
        };

        let mut next_parents = Vec::new();
        for &parent in parents {
            for type_name in scope.iter() {
                let Some(definition) = schema.get_field(type_name, &field.name) else {
                    continue;
                };
                let child = match self.document.child(parent, type_name, &key) {
                    Some(child) => child,
                    None => {
                        let child = self.document.add(Node {
                            name: key.clone(),
                            definition_name: field.name.to_string(),
                            owner_type: type_name.clone(),
                            return_type: Some(definition.ty.clone()),
                            ast_nodes: Vec::new(),
                            definitions: Vec::new(),
                            directives: Vec::new(),
                            typed_children: IndexMap::new(),
                            included: false,
                            parent: Some(parent),
                        });
                        self.document
                            .insert_child(parent, type_name.clone(), key.clone(), child);
                        child
                    }
                };
                let node = self.document.node_mut(child);
                push_unique(&mut node.ast_nodes, field.clone());
                push_unique(&mut node.definitions, definition.clone());
                for directive in field.directives.iter() {
                    push_unique(&mut node.directives, directive.clone());
                }
                node.included |= included;
                next_parents.push(child);
            }
        }

        self.visit_selection_set(&field.selection_set, &next_parents, &child_scope, true, owner);
        self.env.leave_field();
    }

    fn report_undefined_field(&mut self, field: &apollo_compiler::Node<ast::Field>) {
        let Some(parent_type) = self.env.parent_type_definition() else {
            return;
        };
        // Selections on leaves are a different error.
        if self.schema.is_leaf(parent_type) {
            return;
        }
        let error = ValidationError::UndefinedField {
            field: field.name.to_string(),
            type_name: parent_type.to_string(),
            locations: self.locations(std::slice::from_ref(field)),
        };
        self.errors.push(error);
    }

    /// Merges fragments into their spreads, leaves first.
    fn resolve_fragments(&mut self) -> Result<(), ExecutionError> {
        let spreads = std::mem::take(&mut self.spreads);
        let (spreads, undefined): (Vec<Spread>, Vec<Spread>) = spreads
            .into_iter()
            .partition(|spread| {
                self.document
                    .fragment_definitions
                    .contains_key(&spread.fragment)
            });
        let mut undefined_locations: IndexMap<Name, Vec<Location>> = IndexMap::new();
        for spread in undefined {
            let locations = self.locations(std::slice::from_ref(&spread.node));
            undefined_locations
                .entry(spread.fragment)
                .or_default()
                .extend(locations);
        }
        for (name, locations) in undefined_locations {
            self.errors.push(ValidationError::UndefinedFragment {
                name: name.to_string(),
                locations,
            });
        }

        let mut pending_spreads: HashMap<Name, usize> = HashMap::new();
        for spread in &spreads {
            if let Owner::Fragment(owner) = &spread.owner {
                *pending_spreads.entry(owner.clone()).or_default() += 1;
            }
        }
        let mut ready: Vec<Name> = self
            .document
            .fragment_definitions
            .keys()
            .filter(|name| !pending_spreads.contains_key(*name))
            .rev()
            .cloned()
            .collect();

        let limit = self.document.fragment_definitions.len();
        let mut iterations = 0;
        while let Some(name) = ready.pop() {
            iterations += 1;
            if iterations > limit {
                tracing::error!(limit, "fragment resolution did not converge");
                return Err(ExecutionError::FragmentIterationCap { limit });
            }
            let Some(&fragment_root) = self.document.fragment_definitions.get(&name) else {
                continue;
            };
            for spread in spreads.iter().filter(|spread| spread.fragment == name) {
                tracing::debug!(fragment = %name, sites = spread.parents.len(), "merging fragment");
                for &parent in &spread.parents {
                    self.merge_fragment(fragment_root, parent, &spread.scope, spread.included);
                }
                if let Owner::Fragment(owner) = &spread.owner
                    && let Some(count) = pending_spreads.get_mut(owner)
                {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(owner.clone());
                    }
                }
            }
        }

        let unresolved: Vec<Name> = self
            .document
            .fragment_definitions
            .keys()
            .filter(|name| pending_spreads.get(*name).is_some_and(|count| *count > 0))
            .cloned()
            .collect();
        // undefined spreads were dropped above, what is left is on a cycle or depends on one
        for name in unresolved {
            let locations = self.fragment_locations.get(&name).cloned().unwrap_or_default();
            self.errors.push(ValidationError::CyclicalFragment {
                name: name.to_string(),
                locations,
            });
        }
        Ok(())
    }

    fn merge_fragment(&mut self, fragment_root: NodeId, parent: NodeId, scope: &Scope, included: bool) {
        let typed_children = self.document.node(fragment_root).typed_children.clone();
        for (type_name, children) in typed_children {
            if !scope.contains(&type_name) {
                continue;
            }
            for (key, child) in children {
                self.merge_child(parent, &type_name, key, child, included);
            }
        }
    }

    fn merge_child(
        &mut self,
        parent: NodeId,
        type_name: &Name,
        key: String,
        source: NodeId,
        included: bool,
    ) {
        match self.document.child(parent, type_name, &key) {
            Some(target) => self.deep_merge(target, source, included),
            None => {
                let copy = self.deep_copy(source, parent, included);
                self.document
                    .insert_child(parent, type_name.clone(), key, copy);
            }
        }
    }

    fn deep_copy(&mut self, source: NodeId, parent: NodeId, included: bool) -> NodeId {
        let mut node = self.document.node(source).clone();
        let typed_children = std::mem::take(&mut node.typed_children);
        node.parent = Some(parent);
        node.included &= included;
        let copy = self.document.add(node);
        for (type_name, children) in typed_children {
            for (key, child) in children {
                let child_copy = self.deep_copy(child, copy, true);
                self.document
                    .insert_child(copy, type_name.clone(), key, child_copy);
            }
        }
        copy
    }

    fn deep_merge(&mut self, target: NodeId, source: NodeId, included: bool) {
        let source = self.document.node(source).clone();
        let node = self.document.node_mut(target);
        for ast_node in source.ast_nodes {
            push_unique(&mut node.ast_nodes, ast_node);
        }
        for definition in source.definitions {
            push_unique(&mut node.definitions, definition);
        }
        for directive in source.directives {
            push_unique(&mut node.directives, directive);
        }
        node.included |= included && source.included;
        for (type_name, children) in source.typed_children {
            for (key, child) in children {
                self.merge_child(target, &type_name, key, child, true);
            }
        }
    }

    /// Reports response keys selecting different fields, or the same field with different
    /// arguments. Arguments are compared as written: `$a` and `$b` conflict even when both
    /// variables hold the same value.
    fn check_conflicts(&mut self) {
        let roots: Vec<NodeId> = self.document.operation_definitions.values().copied().collect();
        for root in roots {
            for id in self.document.descendants(root) {
                let node = self.document.node(id);
                let field_names = node
                    .ast_nodes
                    .iter()
                    .map(|field| field.name.as_str())
                    .unique()
                    .sorted()
                    .collect::<Vec<_>>();
                let argument_sets = node
                    .ast_nodes
                    .iter()
                    .map(|field| serialize_arguments(field))
                    .unique()
                    .sorted()
                    .collect::<Vec<_>>();
                let mut errors = Vec::new();
                if field_names.len() > 1 {
                    errors.push(ValidationError::FieldConflict {
                        key: node.name.clone(),
                        conflicts: field_names.join(" or "),
                        locations: self.locations(&node.ast_nodes),
                    });
                }
                if argument_sets.len() > 1 {
                    errors.push(ValidationError::ArgumentConflict {
                        key: node.name.clone(),
                        conflicts: argument_sets.join(" or "),
                        locations: self.locations(&node.ast_nodes),
                    });
                }
                for error in errors {
                    if !self.errors.contains(&error) {
                        self.errors.push(error);
                    }
                }
            }
        }
    }
}

fn push_unique<T>(items: &mut Vec<apollo_compiler::Node<T>>, item: apollo_compiler::Node<T>) {
    if !items.iter().any(|existing| existing.ptr_eq(&item)) {
        items.push(item);
    }
}

fn serialize_arguments(field: &ast::Field) -> String {
    let arguments = field
        .arguments
        .iter()
        .map(|argument| format!("{}: {}", argument.name, &*argument.value))
        .sorted()
        .join(", ");
    format!("{{{arguments}}}")
}
