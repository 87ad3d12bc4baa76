//! Argument coercion against field, directive and input object definitions.
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::InputValueDefinition;
use serde_json_bytes::ByteString;

use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::schema::Schema;

/// Coerces the arguments of a field or directive.
///
/// Variables are substituted, enum literals become strings, lists and input objects are
/// coerced recursively and unset arguments take their default value. Arguments referencing
/// a variable which was not provided are left out, unless they have a default.
pub(crate) fn coerce_arguments(
    schema: &Schema,
    definitions: &[Node<InputValueDefinition>],
    arguments: &[Node<ast::Argument>],
    variables: &Object,
) -> Object {
    let mut coerced = Object::new();
    for definition in definitions {
        let provided = arguments
            .iter()
            .find(|argument| argument.name == definition.name)
            .and_then(|argument| coerce_value(schema, &definition.ty, &argument.value, variables));
        let value = provided.or_else(|| {
            definition
                .default_value
                .as_ref()
                .and_then(|default| coerce_value(schema, &definition.ty, default, &Object::new()))
        });
        if let Some(value) = value {
            coerced.insert(ByteString::from(definition.name.as_str()), value);
        }
    }
    coerced
}

/// Coerces an input value literal. `None` stands for a variable which was not provided.
pub(crate) fn coerce_value(
    schema: &Schema,
    ty: &ast::Type,
    value: &ast::Value,
    variables: &Object,
) -> Option<Value> {
    let coerced = match value {
        ast::Value::Null => Value::Null,
        ast::Value::Variable(name) => return variables.get(name.as_str()).cloned(),
        ast::Value::Enum(name) => Value::String(name.as_str().into()),
        ast::Value::String(value) => Value::String(value.as_str().into()),
        ast::Value::Boolean(value) => Value::Bool(*value),
        ast::Value::Int(value) => value
            .as_str()
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| value.try_to_f64().map(Value::from))
            .unwrap_or(Value::Null),
        ast::Value::Float(value) => value.try_to_f64().map(Value::from).unwrap_or(Value::Null),
        ast::Value::List(items) => {
            let item_type = match ty {
                ast::Type::List(item) | ast::Type::NonNullList(item) => item.as_ref(),
                _ => ty,
            };
            Value::Array(
                items
                    .iter()
                    .map(|item| {
                        coerce_value(schema, item_type, item, variables).unwrap_or(Value::Null)
                    })
                    .collect(),
            )
        }
        ast::Value::Object(fields) => coerce_input_object(schema, ty, fields, variables),
    };
    // A single value where a list is expected is a list of one item.
    if ty.is_list() && !matches!(coerced, Value::Array(_) | Value::Null) {
        return Some(Value::Array(vec![coerced]));
    }
    Some(coerced)
}

fn coerce_input_object(
    schema: &Schema,
    ty: &ast::Type,
    fields: &[(apollo_compiler::Name, Node<ast::Value>)],
    variables: &Object,
) -> Value {
    let Some(ExtendedType::InputObject(input_object)) = schema.get_type(ty.inner_named_type())
    else {
        let mut object = Object::new();
        for (name, value) in fields {
            let value = coerce_value(schema, ty, value, variables).unwrap_or(Value::Null);
            object.insert(ByteString::from(name.as_str()), value);
        }
        return Value::Object(object);
    };
    let mut object = Object::new();
    for (name, definition) in &input_object.fields {
        let provided = fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .and_then(|(_, value)| coerce_value(schema, &definition.ty, value, variables));
        let value = provided.or_else(|| {
            definition
                .default_value
                .as_ref()
                .and_then(|default| coerce_value(schema, &definition.ty, default, &Object::new()))
        });
        if let Some(value) = value {
            object.insert(ByteString::from(name.as_str()), value);
        }
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ast::Document;
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;
    use test_log::test;

    use super::*;

    const SDL: &str = r#"
        type Query {
          products(
            first: Int = 10
            order: Order = ASC
            tags: [String]
            filter: Filter
            after: String
          ): [String]
        }
        enum Order { ASC DESC }
        input Filter { minPrice: Float, inStock: Boolean = true, nested: Filter }
    "#;

    fn coerce(query: &str, variables: Value) -> Value {
        let schema = Schema::parse(SDL).unwrap();
        let document = Document::parse(query, "query.graphql").unwrap();
        let Some(ast::Definition::OperationDefinition(operation)) = document.definitions.first()
        else {
            panic!("expected an operation");
        };
        let ast::Selection::Field(field) = &operation.selection_set[0] else {
            panic!("expected a field");
        };
        let definition = schema.get_field("Query", "products").unwrap();
        let variables = variables.as_object().cloned().unwrap_or_default();
        Value::Object(coerce_arguments(
            &schema,
            &definition.arguments,
            &field.arguments,
            &variables,
        ))
    }

    #[test]
    fn defaults_fill_unset_arguments() {
        assert_eq!(
            coerce("{ products }", json!({})),
            json!({ "first": 10, "order": "ASC" })
        );
    }

    #[test]
    fn literals_and_variables_are_coerced() {
        assert_eq!(
            coerce(
                r#"query($n: Int, $after: String) {
                  products(first: $n, order: DESC, tags: "new", filter: { minPrice: 2.5, nested: {} }, after: $after)
                }"#,
                json!({ "n": 3 }),
            ),
            json!({
                "first": 3,
                "order": "DESC",
                "tags": ["new"],
                "filter": { "minPrice": 2.5, "inStock": true, "nested": { "inStock": true } }
            })
        );
    }

    #[test]
    fn missing_variables_fall_back_to_defaults() {
        assert_eq!(
            coerce("query($n: Int) { products(first: $n) }", json!({})),
            json!({ "first": 10, "order": "ASC" })
        );
        assert_eq!(
            coerce("{ products(first: null, tags: [\"a\", \"b\"]) }", json!({})),
            json!({ "first": null, "order": "ASC", "tags": ["a", "b"] })
        );
    }
}
