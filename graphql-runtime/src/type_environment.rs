//! Schema definitions in effect at each point of a query document walk.
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast::OperationType;
use apollo_compiler::schema::DirectiveDefinition;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::InputValueDefinition;

use crate::schema::Schema;

/// Stacks of the types, fields, directives and arguments entered so far.
///
/// Lookups that fail push `None`, so every `enter_*` can be paired with its `leave_*`
/// regardless of the validity of the document.
pub struct TypeEnvironment {
    schema: Schema,
    type_definitions: Vec<Option<Name>>,
    field_definitions: Vec<Option<Node<FieldDefinition>>>,
    directive_definitions: Vec<Option<Node<DirectiveDefinition>>>,
    argument_definitions: Vec<Option<Node<InputValueDefinition>>>,
}

impl TypeEnvironment {
    pub fn new(schema: &Schema) -> Self {
        TypeEnvironment {
            schema: schema.clone(),
            type_definitions: Vec::new(),
            field_definitions: Vec::new(),
            directive_definitions: Vec::new(),
            argument_definitions: Vec::new(),
        }
    }

    /// The type the next fields are looked up on: the return type of the current field.
    pub fn current_type_definition(&self) -> Option<&Name> {
        self.type_definitions.last().and_then(Option::as_ref)
    }

    /// The type which defines the current field.
    pub fn parent_type_definition(&self) -> Option<&Name> {
        let len = self.type_definitions.len();
        len.checked_sub(2)
            .and_then(|index| self.type_definitions[index].as_ref())
    }

    pub fn current_field_definition(&self) -> Option<&Node<FieldDefinition>> {
        self.field_definitions.last().and_then(Option::as_ref)
    }

    /// The field which returned the object of the current field.
    pub fn previous_field_definition(&self) -> Option<&Node<FieldDefinition>> {
        let len = self.field_definitions.len();
        len.checked_sub(2)
            .and_then(|index| self.field_definitions[index].as_ref())
    }

    pub fn current_directive_definition(&self) -> Option<&Node<DirectiveDefinition>> {
        self.directive_definitions.last().and_then(Option::as_ref)
    }

    pub fn current_argument_definition(&self) -> Option<&Node<InputValueDefinition>> {
        self.argument_definitions.last().and_then(Option::as_ref)
    }

    /// The argument (or input field) containing the current input field.
    pub fn previous_argument_definition(&self) -> Option<&Node<InputValueDefinition>> {
        let len = self.argument_definitions.len();
        len.checked_sub(2)
            .and_then(|index| self.argument_definitions[index].as_ref())
    }

    pub fn enter_operation(&mut self, operation_type: OperationType) {
        let root = self.schema.root_type(operation_type).cloned();
        self.type_definitions.push(root);
    }

    /// Enters an inline fragment or a fragment definition. Without a type condition, the
    /// current type stays in effect.
    pub fn enter_type_condition(&mut self, type_condition: Option<&Name>) {
        let type_definition = match type_condition {
            Some(type_condition) => self
                .schema
                .get_type(type_condition)
                .map(|_| type_condition.clone()),
            None => self.current_type_definition().cloned(),
        };
        self.type_definitions.push(type_definition);
    }

    /// Leaves an operation, an inline fragment or a fragment definition.
    pub fn leave_type_condition(&mut self) {
        self.type_definitions.pop();
    }

    pub fn enter_field(&mut self, field_name: &str) {
        let field_definition = self
            .current_type_definition()
            .filter(|parent_type| {
                matches!(
                    self.schema.get_type(parent_type.as_str()),
                    Some(
                        ExtendedType::Object(_)
                            | ExtendedType::Interface(_)
                            | ExtendedType::Union(_)
                    )
                )
            })
            .and_then(|parent_type| self.schema.get_field(parent_type, field_name))
            .cloned();
        let next_type = field_definition
            .as_ref()
            .map(|definition| definition.ty.inner_named_type().clone());
        self.field_definitions.push(field_definition);
        self.type_definitions.push(next_type);
    }

    pub fn leave_field(&mut self) {
        self.field_definitions.pop();
        self.type_definitions.pop();
    }

    pub fn enter_directive(&mut self, directive_name: &str) {
        let directive_definition = self
            .schema
            .definitions()
            .directive_definitions
            .get(directive_name)
            .cloned();
        self.directive_definitions.push(directive_definition);
    }

    pub fn leave_directive(&mut self) {
        self.directive_definitions.pop();
    }

    /// Enters an argument of a field or a directive, or a field of an input object literal.
    pub fn enter_argument(&mut self, argument_name: &str) {
        let argument_definition = if let Some(argument) = self.argument_definitions.last() {
            argument
                .as_ref()
                .and_then(|argument| match self.schema.get_type(argument.ty.inner_named_type()) {
                    Some(ExtendedType::InputObject(input_object)) => input_object
                        .fields
                        .get(argument_name)
                        .map(|field| field.node.clone()),
                    _ => None,
                })
        } else if let Some(Some(directive)) = self.directive_definitions.last() {
            find_argument(&directive.arguments, argument_name)
        } else if let Some(Some(field)) = self.field_definitions.last() {
            find_argument(&field.arguments, argument_name)
        } else {
            None
        };
        self.argument_definitions.push(argument_definition);
    }

    pub fn leave_argument(&mut self) {
        self.argument_definitions.pop();
    }
}

fn find_argument(
    arguments: &[Node<InputValueDefinition>],
    name: &str,
) -> Option<Node<InputValueDefinition>> {
    arguments
        .iter()
        .find(|argument| argument.name == name)
        .cloned()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    const SDL: &str = r#"
        type Query {
          search(filter: Filter): [Item]
          item(id: ID!): Item
        }
        interface Item { id: ID! }
        type Book implements Item { id: ID! title(upper: Boolean): String }
        input Filter { title: String nested: Filter }
    "#;

    #[test]
    fn fields_are_looked_up_on_the_current_type() {
        let schema = Schema::parse(SDL).unwrap();
        let mut env = TypeEnvironment::new(&schema);
        env.enter_operation(OperationType::Query);
        env.enter_field("item");
        assert_eq!(env.current_type_definition().unwrap(), "Item");
        assert_eq!(env.parent_type_definition().unwrap(), "Query");

        env.enter_type_condition(Some(&Name::new("Book").unwrap()));
        env.enter_field("title");
        assert_eq!(env.parent_type_definition().unwrap(), "Book");
        assert_eq!(env.current_field_definition().unwrap().name, "title");
        assert_eq!(env.previous_field_definition().unwrap().name, "item");

        env.enter_argument("upper");
        assert_eq!(env.current_argument_definition().unwrap().name, "upper");
        env.leave_argument();
        env.leave_field();
        env.leave_type_condition();

        env.enter_field("missing");
        assert!(env.current_field_definition().is_none());
        assert!(env.current_type_definition().is_none());
        env.enter_field("deeper");
        assert!(env.current_field_definition().is_none());
    }

    #[test]
    fn nested_input_fields_are_arguments_too() {
        let schema = Schema::parse(SDL).unwrap();
        let mut env = TypeEnvironment::new(&schema);
        env.enter_operation(OperationType::Query);
        env.enter_field("search");
        env.enter_argument("filter");
        env.enter_argument("nested");
        env.enter_argument("title");
        assert_eq!(env.current_argument_definition().unwrap().name, "title");
        assert_eq!(env.previous_argument_definition().unwrap().name, "nested");
    }

    #[test]
    fn directive_arguments_come_from_the_directive() {
        let schema = Schema::parse(SDL).unwrap();
        let mut env = TypeEnvironment::new(&schema);
        env.enter_operation(OperationType::Query);
        env.enter_field("search");
        env.enter_directive("include");
        env.enter_argument("if");
        let argument = env.current_argument_definition().unwrap();
        assert_eq!(argument.ty.to_string(), "Boolean!");
    }
}
