use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::InputValueDefinition;
use indexmap::IndexSet;
use serde_json_bytes::json;

use super::AnalysisResult;
use super::Analyzer;
use super::Visitor;
use crate::error::AnalysisError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::schema::Schema;

/// Reports the fields a query uses, as `Type.field`, and which of them (or of their arguments
/// and input fields) are deprecated.
///
/// Arguments are read once coerced, so defaults and variables count. Skipped fields are
/// reported too.
#[derive(Default)]
pub struct FieldUsage {
    used_fields: IndexSet<String>,
    used_deprecated_fields: IndexSet<String>,
    used_deprecated_arguments: IndexSet<String>,
}

impl FieldUsage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_deprecated(directives: &ast::DirectiveList) -> bool {
    directives.get("deprecated").is_some()
}

impl FieldUsage {
    /// Records the deprecated arguments among `values`, looking into input objects.
    fn extract_deprecated_arguments(
        &mut self,
        schema: &Schema,
        owner: &str,
        definitions: &[Node<InputValueDefinition>],
        values: &Object,
    ) {
        for definition in definitions {
            let Some(value) = values.get(definition.name.as_str()) else {
                continue;
            };
            if is_deprecated(&definition.directives) {
                self.used_deprecated_arguments
                    .insert(format!("{owner}.{}", definition.name));
            }
            let input_type = definition.ty.inner_named_type();
            let Some(ExtendedType::InputObject(input_object)) = schema.get_type(input_type) else {
                continue;
            };
            let fields: Vec<Node<InputValueDefinition>> = input_object
                .fields
                .values()
                .map(|field| field.node.clone())
                .collect();
            let objects = match value {
                Value::Object(object) => vec![object],
                Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
                _ => Vec::new(),
            };
            for object in objects {
                self.extract_deprecated_arguments(schema, input_type, &fields, object);
            }
        }
    }
}

impl Analyzer for FieldUsage {
    fn on_leave_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        let (Some(parent_type), Some(definition)) =
            (visitor.parent_type_definition(), visitor.field_definition())
        else {
            return Ok(());
        };
        let coordinate = format!("{parent_type}.{}", definition.name);
        if is_deprecated(&definition.directives) {
            self.used_deprecated_fields.insert(coordinate.clone());
        }
        let arguments = visitor.arguments_for(field);
        self.extract_deprecated_arguments(
            visitor.schema(),
            &coordinate,
            &definition.arguments,
            &arguments,
        );
        self.used_fields.insert(coordinate);
        Ok(())
    }

    fn result(&mut self) -> AnalysisResult {
        Ok(json!({
            "used_fields": self.used_fields.iter().collect::<Vec<_>>(),
            "used_deprecated_fields": self.used_deprecated_fields.iter().collect::<Vec<_>>(),
            "used_deprecated_arguments": self.used_deprecated_arguments.iter().collect::<Vec<_>>(),
        }))
    }
}
