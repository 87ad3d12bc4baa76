use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::schema::FieldDefinition;
use indexmap::IndexMap;

use super::AnalysisResult;
use super::Analyzer;
use super::Visitor;
use crate::context::Context;
use crate::error::AnalysisError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::schema::Schema;

/// A field of the selected operation, merged across every selection with the same
/// response key on the same type.
pub(crate) struct ScopedField {
    pub(crate) parent_type: Option<Name>,
    pub(crate) definition: Option<Node<FieldDefinition>>,
    /// Coerced arguments, one per merged selection.
    pub(crate) arguments: Vec<Object>,
    pub(crate) response_path: Vec<String>,
    children: IndexMap<(Option<Name>, String), usize>,
}

/// The fields of one operation, keyed by the type they are selected on and their response key.
///
/// Selections on different types of an abstract field are mutually exclusive at runtime, so
/// the cost of a selection set is the most expensive set of fields one object type could
/// receive.
pub(crate) struct ScopeTree {
    schema: Schema,
    context: Context,
    fields: Vec<ScopedField>,
    stack: Vec<usize>,
}

impl ScopeTree {
    pub(crate) fn new(visitor: &Visitor<'_>) -> Self {
        ScopeTree {
            schema: visitor.schema().clone(),
            context: visitor.query().context().clone(),
            fields: vec![ScopedField {
                parent_type: None,
                definition: None,
                arguments: Vec::new(),
                response_path: Vec::new(),
                children: IndexMap::new(),
            }],
            stack: vec![0],
        }
    }

    pub(crate) fn enter(&mut self, field: &ast::Field, visitor: &Visitor<'_>) {
        let parent_type = visitor.parent_type_definition().cloned();
        let key = field.alias.as_ref().unwrap_or(&field.name).to_string();
        let current = self.stack.last().copied().unwrap_or(0);
        let next_id = self.fields.len();
        let id = *self.fields[current]
            .children
            .entry((parent_type.clone(), key))
            .or_insert(next_id);
        if id == next_id {
            self.fields.push(ScopedField {
                parent_type,
                definition: visitor.field_definition().cloned(),
                arguments: Vec::new(),
                response_path: visitor.response_path().to_vec(),
                children: IndexMap::new(),
            });
        }
        self.fields[id].arguments.push(visitor.arguments_for(field));
        self.stack.push(id);
    }

    pub(crate) fn leave(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    /// The cost of the operation, given the cost of a field from the cost of its selections.
    ///
    /// Fields are costed leaves first.
    pub(crate) fn total(
        &self,
        field_cost: &mut dyn FnMut(&Schema, &Context, &ScopedField, u64) -> u64,
    ) -> u64 {
        self.children_cost(0, field_cost)
    }

    fn field_cost(
        &self,
        id: usize,
        field_cost: &mut dyn FnMut(&Schema, &Context, &ScopedField, u64) -> u64,
    ) -> u64 {
        let children = self.children_cost(id, field_cost);
        field_cost(&self.schema, &self.context, &self.fields[id], children)
    }

    fn children_cost(
        &self,
        id: usize,
        field_cost: &mut dyn FnMut(&Schema, &Context, &ScopedField, u64) -> u64,
    ) -> u64 {
        let mut per_type: IndexMap<Option<Name>, u64> = IndexMap::new();
        for ((parent_type, _), &child) in &self.fields[id].children {
            let cost = self.field_cost(child, field_cost);
            let possible_types = parent_type
                .as_ref()
                .map(|parent_type| self.schema.possible_types(parent_type))
                .unwrap_or_default();
            if possible_types.is_empty() {
                let total = per_type.entry(parent_type.clone()).or_default();
                *total = total.saturating_add(cost);
            }
            for possible_type in possible_types {
                let total = per_type.entry(Some(possible_type)).or_default();
                *total = total.saturating_add(cost);
            }
        }
        per_type.values().copied().max().unwrap_or(0)
    }
}

/// The cost of a field: the field's [`Complexity`](crate::schema::Complexity), 1 plus
/// the cost of its selections unless configured otherwise.
fn field_complexity(schema: &Schema, context: &Context, field: &ScopedField, children: u64) -> u64 {
    let (Some(parent_type), Some(definition)) = (&field.parent_type, &field.definition) else {
        return children;
    };
    let arguments = field.arguments.first().cloned().unwrap_or_default();
    let complexity = schema
        .complexity(parent_type, &definition.name)
        .cloned()
        .unwrap_or_default();
    complexity.compute(context, &arguments, children)
}

/// Sums the complexity of every query it visits. Skipped fields cost nothing.
#[derive(Default)]
pub struct QueryComplexity {
    trees: Vec<ScopeTree>,
}

impl QueryComplexity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.trees
            .iter()
            .map(|tree| tree.total(&mut field_complexity))
            .fold(0, u64::saturating_add)
    }
}

impl Analyzer for QueryComplexity {
    fn on_enter_operation_definition(
        &mut self,
        _operation: &Node<ast::OperationDefinition>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        self.trees.push(ScopeTree::new(visitor));
        Ok(())
    }

    fn on_enter_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        if visitor.skipping() {
            return Ok(());
        }
        if let Some(tree) = self.trees.last_mut() {
            tree.enter(field, visitor);
        }
        Ok(())
    }

    fn on_leave_field(
        &mut self,
        _field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        if visitor.skipping() {
            return Ok(());
        }
        if let Some(tree) = self.trees.last_mut() {
            tree.leave();
        }
        Ok(())
    }

    fn result(&mut self) -> AnalysisResult {
        let total = self.total();
        tracing::debug!(total, queries = self.trees.len(), "query complexity");
        Ok(Value::from(total))
    }
}

/// Fails queries whose complexity exceeds `max`.
pub struct MaxQueryComplexity {
    complexity: QueryComplexity,
    max: u64,
    warn_only: bool,
}

impl MaxQueryComplexity {
    pub fn new(max: u64) -> Self {
        MaxQueryComplexity {
            complexity: QueryComplexity::new(),
            max,
            warn_only: false,
        }
    }

    /// Logs a warning instead of failing.
    pub fn warn_only(mut self, warn_only: bool) -> Self {
        self.warn_only = warn_only;
        self
    }
}

impl Analyzer for MaxQueryComplexity {
    fn on_enter_operation_definition(
        &mut self,
        operation: &Node<ast::OperationDefinition>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        self.complexity
            .on_enter_operation_definition(operation, visitor)
    }

    fn on_enter_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        self.complexity.on_enter_field(field, visitor)
    }

    fn on_leave_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        self.complexity.on_leave_field(field, visitor)
    }

    fn result(&mut self) -> AnalysisResult {
        let actual = self.complexity.total();
        if actual <= self.max {
            return Ok(Value::Null);
        }
        if self.warn_only {
            tracing::warn!(actual, max = self.max, "query complexity exceeds the limit");
            return Ok(Value::Null);
        }
        Err(AnalysisError::MaxComplexity {
            actual,
            max: self.max,
        })
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json_bytes::json;

    use super::*;
    use crate::analysis::analyze_multiplex;
    use crate::analysis::analyze_query;
    use crate::analysis::test_support::*;
    use crate::configuration::Configuration;
    use crate::schema::Complexity;

    fn complexity(schema: &Schema, query: &str) -> u64 {
        let query = prepare(schema, query);
        let results = analyze_query(&query, vec![Box::new(QueryComplexity::new())]);
        results[0].as_ref().unwrap().as_u64().unwrap()
    }

    #[rstest]
    #[case::simple(
        r#"query cheeses($isSkipped: Boolean = false) {
          cheese1: cheese(id: 1) { id flavor }
          cheese2: cheese(id: 2) @skip(if: $isSkipped) { similarCheese(source: SHEEP) { ... on Cheese { similarCheese(source: SHEEP) { id } } } }
        }"#,
        7
    )]
    #[case::skipped(
        r#"query cheeses($isSkipped: Boolean = true) {
          cheese1: cheese(id: 1) { id flavor }
          cheese2: cheese(id: 2) @skip(if: $isSkipped) { similarCheese(source: SHEEP) { ... on Cheese { similarCheese(source: SHEEP) { id } } } }
        }"#,
        3
    )]
    #[case::fragments(
        r#"{
          cheese(id: 1) { ...cheeseFields }
          milk(id: "1") { ...milkFields }
        }
        fragment cheeseFields on Cheese { id flavor similarCheese(source: COW) { ...cheeseFields2 } }
        fragment cheeseFields2 on Cheese { id flavor similarCheese(source: SHEEP) { id } }
        fragment milkFields on Milk { id }"#,
        10
    )]
    #[case::mutually_exclusive_types(
        r#"{
          favoriteEdible {
            __typename
            ... on Edible { fatContent }
            ... on Milk { id flavors }
            ... on Cheese { id flavor }
          }
        }"#,
        5
    )]
    #[case::no_object_selections(
        r#"{
          favoriteEdible { ... on Sweetener { sweetness } ... on Edible { fatContent origin } }
        }"#,
        4
    )]
    #[case::redundant_fields(
        r#"{ cheese(id: 1) { id ... on Cheese { id } ...cheeseId } }
        fragment cheeseId on Cheese { id }"#,
        2
    )]
    fn costs_of_selections(#[case] query: &str, #[case] expected: u64) {
        assert_eq!(complexity(&dairy(), query), expected);
    }

    const CUSTOM_SDL: &str = r#"
        type Query {
          complexity(value: Int): SingleComplexity
          innerComplexity(value: Int): ComplexityInterface
        }
        interface ComplexityInterface { value: Int }
        type SingleComplexity implements ComplexityInterface {
          value: Int
          complexity(value: Int): SingleComplexity
        }
        type DoubleComplexity implements ComplexityInterface { value: Int }
    "#;

    fn custom_schema() -> Schema {
        let by_value = || {
            Complexity::custom(|_, arguments, child| {
                arguments.get("value").and_then(Value::as_u64).unwrap_or(0) + child
            })
        };
        Schema::builder(CUSTOM_SDL)
            .complexity("Query", "complexity", by_value())
            .complexity("SingleComplexity", "complexity", by_value())
            .complexity("SingleComplexity", "value", Complexity::Fixed(0))
            .complexity("DoubleComplexity", "value", Complexity::Fixed(4))
            .build()
            .unwrap()
    }

    #[test_log::test]
    fn custom_complexities_see_arguments_and_children() {
        let query = r#"{
          a: complexity(value: 3) { value }
          b: complexity(value: 6) { value complexity(value: 1) { value } }
        }"#;
        assert_eq!(complexity(&custom_schema(), query), 10);
    }

    #[test_log::test]
    fn the_most_expensive_possible_type_wins() {
        let query = r#"{
          innerComplexity(value: 2) {
            ... on SingleComplexity { value }
            ... on DoubleComplexity { value }
          }
        }"#;
        assert_eq!(complexity(&custom_schema(), query), 5);
    }

    #[test_log::test]
    fn multiplex_complexity_is_the_sum() {
        let schema = dairy();
        let mut queries = vec![
            prepare(&schema, "{ cheese(id: 1) { id flavor source } }"),
            prepare(&schema, "{ cheese(id: 2) { id flavor source } }"),
        ];
        let results = analyze_multiplex(&mut queries, vec![Box::new(QueryComplexity::new())]);
        assert_eq!(results[0].clone().unwrap(), json!(8));

        let mut queries = vec![
            prepare(&schema, "{ allEdible { origin fatContent } }"),
            prepare(&schema, "{ allEdible { origin fatContent } }"),
        ];
        let results = analyze_multiplex(&mut queries, vec![Box::new(QueryComplexity::new())]);
        assert_eq!(results[0].clone().unwrap(), json!(6));
    }

    #[test_log::test]
    fn the_limit_fails_every_query_of_the_multiplex() {
        let schema = dairy();
        let mut queries: Vec<_> = (1..=5)
            .map(|id| prepare(&schema, &format!("{{ cheese(id: {id}) {{ id }} }}")))
            .collect();
        let results = analyze_multiplex(&mut queries, vec![Box::new(MaxQueryComplexity::new(9))]);
        assert_snapshot!(
            results[0].clone().unwrap_err().to_string(),
            @"Query has complexity of 10, which exceeds max complexity of 9"
        );
        for query in &queries {
            assert_eq!(query.analysis_errors().len(), 1);
            assert!(!query.is_executable());
        }
    }

    #[test_log::test]
    fn configured_limits_apply_per_query() {
        let configuration: Configuration = "limits:\n  max_complexity: 2\n".parse().unwrap();
        let schema = Schema::builder(DAIRY)
            .configuration(configuration)
            .build()
            .unwrap();
        let mut queries = vec![
            prepare(&schema, "{ cheese(id: 1) { id } }"),
            prepare(&schema, "{ cheese(id: 1) { id flavor } }"),
        ];
        analyze_multiplex(&mut queries, Vec::new());
        assert!(queries[0].analysis_errors().is_empty());
        assert_eq!(
            queries[1].analysis_errors(),
            &[AnalysisError::MaxComplexity { actual: 3, max: 2 }]
        );
    }

    #[test_log::test]
    fn warn_only_limits_let_queries_through() {
        let schema = dairy();
        let query = prepare(&schema, "{ cheese(id: 1) { id flavor } }");
        let results = analyze_query(
            &query,
            vec![Box::new(MaxQueryComplexity::new(1).warn_only(true))],
        );
        assert_eq!(results[0].clone().unwrap(), Value::Null);
    }
}
