//! One query of a multiplex: its parsed document, selected operation and static errors.

mod arguments;
mod directives;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
pub(crate) use arguments::coerce_arguments;
pub(crate) use arguments::coerce_value;
pub(crate) use directives::directives_include;
use indexmap::IndexMap;
use serde_json_bytes::ByteString;

use crate::context::Context;
use crate::dataloader::Dataloader;
use crate::error::AnalysisError;
use crate::error::ExecutionError;
use crate::error::ValidationError;
use crate::graphql;
use crate::graphql::IntoGraphQLError;
use crate::graphql::Location;
use crate::graphql::Request;
use crate::ir;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::schema::Schema;

/// A parsed and statically checked query, ready for analysis and execution.
pub struct Query {
    schema: Schema,
    document: ast::Document,
    operation: Option<Node<ast::OperationDefinition>>,
    fragments: IndexMap<Name, Node<ast::FragmentDefinition>>,
    variables: Object,
    root_value: Value,
    context: Context,
    ir: ir::Document,
    validation_errors: Vec<ValidationError>,
    analysis_errors: Vec<AnalysisError>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("operation_name", &self.operation_name())
            .field("variables", &self.variables)
            .field("validation_errors", &self.validation_errors)
            .field("analysis_errors", &self.analysis_errors)
            .finish()
    }
}

impl Query {
    /// Parses `request.query`, selects the operation to run and rewrites the document.
    ///
    /// Syntax and validation problems do not fail: they are kept in
    /// [`Query::validation_errors`] and the query is not executed.
    pub fn new(
        schema: &Schema,
        request: Request,
        dataloader: &Dataloader,
    ) -> Result<Self, ExecutionError> {
        let Request {
            query,
            operation_name,
            variables,
            root_value,
            context,
        } = request;
        let context = Context::with_entries(dataloader.clone(), context);
        let mut query = match ast::Document::parse(query, "query.graphql") {
            Ok(document) => Query {
                schema: schema.clone(),
                document,
                operation: None,
                fragments: IndexMap::new(),
                variables,
                root_value,
                context,
                ir: ir::Document::default(),
                validation_errors: Vec::new(),
                analysis_errors: Vec::new(),
            },
            Err(with_errors) => {
                let validation_errors = with_errors
                    .errors
                    .iter()
                    .map(|diagnostic| {
                        let error = diagnostic.to_json();
                        ValidationError::Syntax {
                            message: error.message,
                            locations: error
                                .locations
                                .iter()
                                .map(|location| Location {
                                    line: location.line as u32,
                                    column: location.column as u32,
                                })
                                .collect(),
                        }
                    })
                    .collect();
                return Ok(Query {
                    schema: schema.clone(),
                    document: with_errors.partial,
                    operation: None,
                    fragments: IndexMap::new(),
                    variables,
                    root_value,
                    context,
                    ir: ir::Document::default(),
                    validation_errors,
                    analysis_errors: Vec::new(),
                });
            }
        };

        for definition in &query.document.definitions {
            if let ast::Definition::FragmentDefinition(fragment) = definition {
                query
                    .fragments
                    .insert(fragment.name.clone(), fragment.clone());
            }
        }
        match query.select_operation(operation_name.as_deref()) {
            Ok(operation) => query.operation = Some(operation),
            Err(error) => {
                query.validation_errors.push(error);
                return Ok(query);
            }
        }
        query.apply_variable_defaults();

        let (document, errors) = ir::rewrite(schema, &query.document, &query.variables)?;
        query.ir = document;
        query.validation_errors.extend(errors);
        Ok(query)
    }

    fn select_operation(
        &self,
        operation_name: Option<&str>,
    ) -> Result<Node<ast::OperationDefinition>, ValidationError> {
        let operations: Vec<&Node<ast::OperationDefinition>> = self
            .document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::OperationDefinition(operation) => Some(operation),
                _ => None,
            })
            .collect();
        let operation = match operation_name {
            _ if operations.is_empty() => return Err(ValidationError::NoOperation),
            Some(name) => operations
                .into_iter()
                .find(|operation| operation.name.as_deref() == Some(name))
                .ok_or_else(|| ValidationError::UnknownOperation {
                    name: name.to_string(),
                })?,
            None if operations.len() == 1 => operations[0],
            None => return Err(ValidationError::OperationNameRequired),
        };
        if self.schema.root_type(operation.operation_type).is_none() {
            return Err(ValidationError::UnsupportedOperation {
                operation_type: operation_type_name(operation.operation_type).to_string(),
                locations: self.locations(std::slice::from_ref(operation)),
            });
        }
        Ok(operation.clone())
    }

    /// Fills variables the request left out with their declared default.
    fn apply_variable_defaults(&mut self) {
        let Some(operation) = &self.operation else {
            return;
        };
        for definition in &operation.variables {
            if self.variables.contains_key(definition.name.as_str()) {
                continue;
            }
            let Some(default) = &definition.default_value else {
                continue;
            };
            if let Some(value) =
                coerce_value(&self.schema, &definition.ty, default, &Object::new())
            {
                self.variables
                    .insert(ByteString::from(definition.name.as_str()), value);
            }
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn document(&self) -> &ast::Document {
        &self.document
    }

    /// The operation to run, unless none could be selected.
    pub fn operation(&self) -> Option<&Node<ast::OperationDefinition>> {
        self.operation.as_ref()
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation
            .as_ref()
            .and_then(|operation| operation.name.as_deref())
    }

    pub fn operation_type(&self) -> Option<OperationType> {
        self.operation
            .as_ref()
            .map(|operation| operation.operation_type)
    }

    pub fn is_mutation(&self) -> bool {
        self.operation_type() == Some(OperationType::Mutation)
    }

    /// How the operation is named in load error messages: its name, or its type when anonymous.
    pub(crate) fn operation_label(&self) -> String {
        match (self.operation_name(), self.operation_type()) {
            (Some(name), _) => name.to_string(),
            (None, Some(operation_type)) => operation_type_name(operation_type).to_string(),
            (None, None) => "query".to_string(),
        }
    }

    /// The root type of the selected operation.
    pub fn root_type(&self) -> Option<&Name> {
        self.operation_type()
            .and_then(|operation_type| self.schema.root_type(operation_type))
    }

    pub fn fragment(&self, name: &str) -> Option<&Node<ast::FragmentDefinition>> {
        self.fragments.get(name)
    }

    /// Request variables, completed with the defaults declared by the operation.
    pub fn variables(&self) -> &Object {
        &self.variables
    }

    pub fn root_value(&self) -> &Value {
        &self.root_value
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The rewritten document.
    pub fn ir(&self) -> &ir::Document {
        &self.ir
    }

    /// The root of the selected operation in [`Query::ir`].
    pub fn ir_root(&self) -> Option<ir::NodeId> {
        self.operation.as_ref()?;
        self.ir.operation(self.operation_name())
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        &self.validation_errors
    }

    pub fn analysis_errors(&self) -> &[AnalysisError] {
        &self.analysis_errors
    }

    pub(crate) fn add_analysis_error(&mut self, error: AnalysisError) {
        self.analysis_errors.push(error);
    }

    /// Whether the query may be analyzed: it parsed and an operation was selected.
    pub fn is_valid(&self) -> bool {
        self.operation.is_some() && self.validation_errors.is_empty()
    }

    /// Whether the query may be executed.
    pub fn is_executable(&self) -> bool {
        self.is_valid() && self.analysis_errors.is_empty()
    }

    /// Validation and analysis errors, in the response error shape.
    pub(crate) fn static_errors(&self) -> Vec<graphql::Error> {
        self.validation_errors
            .iter()
            .map(|error| error.to_graphql_error(None))
            .chain(
                self.analysis_errors
                    .iter()
                    .map(|error| error.to_graphql_error(None)),
            )
            .collect()
    }

    pub(crate) fn locations<T>(&self, nodes: &[Node<T>]) -> Vec<Location> {
        nodes
            .iter()
            .filter_map(|node| Location::from_node(node, &self.document.sources))
            .collect()
    }
}

pub(crate) fn operation_type_name(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;
    use test_log::test;

    use super::*;

    const SDL: &str = r#"
        type Query { hello(name: String): String count: Int }
        type Mutation { bump: Int }
    "#;

    fn query(query: &str, operation_name: Option<&str>) -> Query {
        let schema = Schema::parse(SDL).unwrap();
        let request = Request::builder()
            .query(query)
            .and_operation_name(operation_name.map(ToString::to_string))
            .build();
        Query::new(&schema, request, &Dataloader::default()).unwrap()
    }

    fn first_error(query: &Query) -> String {
        query.validation_errors()[0].to_string()
    }

    #[test]
    fn operations_are_selected_by_name() {
        let document = "query A { hello } query B { count } mutation C { bump }";
        let selected = query(document, Some("B"));
        assert!(selected.is_valid());
        assert_eq!(selected.operation_name(), Some("B"));
        assert_eq!(selected.operation_label(), "B");
        assert!(query(document, Some("C")).is_mutation());

        assert_snapshot!(first_error(&query(document, None)), @"An operation name is required");
        assert_snapshot!(first_error(&query(document, Some("D"))), @"Unknown operation named 'D'");
        assert_snapshot!(
            first_error(&query("fragment F on Query { hello }", None)),
            @"No operations in query document"
        );
        assert_snapshot!(
            first_error(&query("subscription { hello }", None)),
            @"Schema is not configured for subscriptions"
        );
    }

    #[test]
    fn anonymous_operations_are_labelled_by_type() {
        let anonymous = query("{ hello }", None);
        assert_eq!(anonymous.operation_label(), "query");
        assert_eq!(anonymous.root_type().unwrap(), "Query");
        assert!(anonymous.ir_root().is_some());
    }

    #[test]
    fn syntax_errors_carry_locations() {
        let broken = query("{ hello(name: ) }", None);
        assert!(!broken.is_valid());
        let ValidationError::Syntax { locations, .. } = &broken.validation_errors()[0] else {
            panic!("expected a syntax error");
        };
        assert_eq!(locations[0].line, 1);
        assert!(broken.operation().is_none());
    }

    #[test]
    fn declared_defaults_complete_the_variables() {
        let schema = Schema::parse(SDL).unwrap();
        let request = Request::builder()
            .query(r#"query($name: String = "world", $other: String = "x") { hello(name: $name) }"#)
            .variable("other", json!("given"))
            .build();
        let query = Query::new(&schema, request, &Dataloader::default()).unwrap();
        assert_eq!(
            Value::Object(query.variables().clone()),
            json!({ "other": "given", "name": "world" })
        );
    }
}
