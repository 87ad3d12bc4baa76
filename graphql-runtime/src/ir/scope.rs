use apollo_compiler::Name;

use crate::schema::Schema;

/// The object types a selection may apply to at some point of a document.
///
/// Entering a type condition intersects the scope with the condition's possible types, so
/// a scope only ever shrinks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    types: Vec<Name>,
}

impl Scope {
    /// The possible types of `type_name`. Leaf and unknown types have an empty scope.
    pub fn of(schema: &Schema, type_name: &str) -> Self {
        Scope {
            types: schema.possible_types(type_name),
        }
    }

    pub fn enter(&self, schema: &Schema, type_condition: Option<&str>) -> Self {
        let Some(type_condition) = type_condition else {
            return self.clone();
        };
        let possible_types = schema.possible_types(type_condition);
        Scope {
            types: self
                .types
                .iter()
                .filter(|name| possible_types.contains(name))
                .cloned()
                .collect(),
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.iter().any(|name| name == type_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Name> {
        self.types.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
