//! Static analysis of queries before execution.
//!
//! Analyzers are called back while the selected operation is walked, see [`Visitor`].
//! An analyzer returning an error stops being called, and the error becomes its result.
//! Errors of query analyzers (and of multiplex analyzers, for every query of the multiplex)
//! are added to the query, which is then not executed.

mod field_usage;
mod query_complexity;
mod query_depth;
mod reducer;
mod shopify_complexity;
mod visitor;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
pub use field_usage::FieldUsage;
pub use query_complexity::MaxQueryComplexity;
pub use query_complexity::QueryComplexity;
pub use query_depth::MaxQueryDepth;
pub use query_depth::QueryDepth;
pub use reducer::IrComplexity;
pub use reducer::QueryReducer;
pub use reducer::Visit;
pub use reducer::analyze_ir;
pub use reducer::analyze_ir_multiplex;
pub use shopify_complexity::ShopifyComplexity;
pub use visitor::Visitor;

use crate::error::AnalysisError;
use crate::json_ext::Value;
use crate::query::Query;

/// What an analyzer produced, or why it stopped.
pub type AnalysisResult = Result<Value, AnalysisError>;

/// Called back for each node of the selected operation.
///
/// Every node is visited, including the ones excluded by `@skip`/`@include`:
/// see [`Visitor::skipping`].
pub trait Analyzer {
    /// Whether this analyzer runs for `query`. Analyzers which don't run have a `null` result.
    fn analyze(&self, _query: &Query) -> bool {
        true
    }

    fn on_enter_operation_definition(
        &mut self,
        _operation: &Node<ast::OperationDefinition>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_leave_operation_definition(
        &mut self,
        _operation: &Node<ast::OperationDefinition>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_enter_field(
        &mut self,
        _field: &Node<ast::Field>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_leave_field(
        &mut self,
        _field: &Node<ast::Field>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    /// Also called for the fields of input object literals.
    fn on_enter_argument(
        &mut self,
        _name: &Name,
        _value: &Node<ast::Value>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_leave_argument(
        &mut self,
        _name: &Name,
        _value: &Node<ast::Value>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_enter_directive(
        &mut self,
        _directive: &Node<ast::Directive>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_leave_directive(
        &mut self,
        _directive: &Node<ast::Directive>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_enter_inline_fragment(
        &mut self,
        _inline_fragment: &Node<ast::InlineFragment>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_leave_inline_fragment(
        &mut self,
        _inline_fragment: &Node<ast::InlineFragment>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    /// The fragment's selections are visited between the two spread callbacks.
    fn on_enter_fragment_spread(
        &mut self,
        _spread: &Node<ast::FragmentSpread>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_leave_fragment_spread(
        &mut self,
        _spread: &Node<ast::FragmentSpread>,
        _visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }

    /// Called once, after every query the analyzer runs for has been visited.
    fn result(&mut self) -> AnalysisResult;
}

pub(crate) struct Slot {
    analyzer: Box<dyn Analyzer>,
    error: Option<AnalysisError>,
    skipped: bool,
}

impl Slot {
    fn new(analyzer: Box<dyn Analyzer>) -> Self {
        Slot {
            analyzer,
            error: None,
            skipped: false,
        }
    }

    fn result(&mut self) -> AnalysisResult {
        if self.skipped {
            return Ok(Value::Null);
        }
        match self.error.take() {
            Some(error) => Err(error),
            None => self.analyzer.result(),
        }
    }
}

/// Runs `analyzers` over the selected operation of `query`.
///
/// Returns one result per analyzer, in order. Nothing is visited when the query is invalid.
#[tracing::instrument(skip_all)]
pub fn analyze_query(query: &Query, analyzers: Vec<Box<dyn Analyzer>>) -> Vec<AnalysisResult> {
    let mut slots: Vec<Slot> = analyzers.into_iter().map(Slot::new).collect();
    for slot in &mut slots {
        slot.skipped = !slot.analyzer.analyze(query);
    }
    if query.is_valid() {
        let mut runnable: Vec<&mut Slot> = slots.iter_mut().filter(|slot| !slot.skipped).collect();
        visitor::visit(query, &mut runnable);
    }
    slots.iter_mut().map(Slot::result).collect()
}

/// Runs the schema's query analyzers over each query, and `analyzers` over all of them.
///
/// Errors are added to the queries: multiplex analyzer errors first, to every query,
/// then each query's own. Returns the results of `analyzers`.
#[tracing::instrument(skip_all, fields(queries = queries.len()))]
pub fn analyze_multiplex(
    queries: &mut [Query],
    analyzers: Vec<Box<dyn Analyzer>>,
) -> Vec<AnalysisResult> {
    // a multiplex analyzer no query runs for yields null
    let mut multiplex_slots: Vec<Slot> = analyzers
        .into_iter()
        .map(|analyzer| Slot {
            skipped: true,
            ..Slot::new(analyzer)
        })
        .collect();
    let mut query_errors: Vec<Vec<AnalysisError>> = Vec::with_capacity(queries.len());
    for query in queries.iter() {
        if !query.is_valid() {
            query_errors.push(Vec::new());
            continue;
        }
        let mut query_slots: Vec<Slot> = query
            .schema()
            .query_analyzers()
            .into_iter()
            .map(Slot::new)
            .collect();
        for slot in &mut query_slots {
            slot.skipped = !slot.analyzer.analyze(query);
        }
        let runs: Vec<bool> = multiplex_slots
            .iter_mut()
            .map(|slot| {
                let runs = slot.analyzer.analyze(query);
                slot.skipped &= !runs;
                runs
            })
            .collect();
        let mut runnable: Vec<&mut Slot> = query_slots
            .iter_mut()
            .filter(|slot| !slot.skipped)
            .chain(
                multiplex_slots
                    .iter_mut()
                    .zip(runs)
                    .filter_map(|(slot, runs)| runs.then_some(slot)),
            )
            .collect();
        visitor::visit(query, &mut runnable);
        query_errors.push(
            query_slots
                .iter_mut()
                .filter_map(|slot| slot.result().err())
                .collect(),
        );
    }

    let results: Vec<AnalysisResult> = multiplex_slots.iter_mut().map(Slot::result).collect();
    let multiplex_errors: Vec<AnalysisError> = results
        .iter()
        .filter_map(|result| result.as_ref().err().cloned())
        .collect();
    for (query, errors) in queries.iter_mut().zip(query_errors) {
        for error in multiplex_errors.iter().cloned().chain(errors) {
            query.add_analysis_error(error);
        }
    }
    tracing::debug!(
        errors = multiplex_errors.len(),
        "multiplex analyzed"
    );
    results
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json_bytes::json;

    use crate::dataloader::Dataloader;
    use crate::graphql::Request;
    use crate::json_ext::Object;
    use crate::json_ext::Value;
    use crate::query::Query;
    use crate::schema::Schema;

    pub(crate) const DAIRY: &str = include_str!("fixtures/dairy.graphql");
    pub(crate) const SHOP: &str = include_str!("fixtures/shop.graphql");

    pub(crate) fn dairy() -> Schema {
        Schema::parse(DAIRY).unwrap()
    }

    pub(crate) fn prepare(schema: &Schema, query: &str) -> Query {
        prepare_with(schema, query, json!({}))
    }

    pub(crate) fn prepare_with(schema: &Schema, query: &str, variables: Value) -> Query {
        let variables: Object = match variables {
            Value::Object(variables) => variables,
            _ => Object::new(),
        };
        let request = Request::builder()
            .query(query)
            .variables(variables)
            .build();
        let query = Query::new(schema, request, &Dataloader::default()).unwrap();
        assert!(query.is_valid(), "{:?}", query.validation_errors());
        query
    }
}
