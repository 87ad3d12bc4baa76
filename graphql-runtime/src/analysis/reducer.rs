//! Reducers over the rewritten document, the older way to analyze queries.
//!
//! Unlike [`Analyzer`](super::Analyzer)s, reducers see fields already split per object type,
//! fragments merged in. Fields excluded by `@skip`/`@include` are not visited.
use apollo_compiler::Name;
use indexmap::IndexMap;

use super::AnalysisResult;
use crate::error::AnalysisError;
use crate::ir;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::query::Query;
use crate::query::coerce_arguments;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    Enter,
    Leave,
}

/// Called for every node of every operation of the rewritten document, depth first.
pub trait QueryReducer {
    fn analyze(&self, _query: &Query) -> bool {
        true
    }

    /// Called before the nodes of `query` are visited.
    fn initial_value(&mut self, _query: &Query) {}

    fn call(&mut self, visit: Visit, node: &ir::Node, query: &Query) -> Result<(), AnalysisError>;

    /// Called once, after every query the reducer runs for has been visited.
    fn final_value(&mut self) -> AnalysisResult;
}

struct ReducerSlot {
    reducer: Box<dyn QueryReducer>,
    error: Option<AnalysisError>,
    skipped: bool,
}

impl ReducerSlot {
    fn new(reducer: Box<dyn QueryReducer>) -> Self {
        ReducerSlot {
            reducer,
            error: None,
            skipped: false,
        }
    }

    fn final_value(&mut self) -> AnalysisResult {
        if self.skipped {
            return Ok(Value::Null);
        }
        match self.error.take() {
            Some(error) => Err(error),
            None => self.reducer.final_value(),
        }
    }
}

fn reduce_query(query: &Query, slots: &mut [&mut ReducerSlot]) {
    for slot in slots.iter_mut() {
        slot.reducer.initial_value(query);
    }
    let document = query.ir();
    for &root in document.operation_definitions.values() {
        reduce_node(document, root, query, slots);
    }
}

fn reduce_node(
    document: &ir::Document,
    id: ir::NodeId,
    query: &Query,
    slots: &mut [&mut ReducerSlot],
) {
    let node = document.node(id);
    if !node.included {
        return;
    }
    call(slots, Visit::Enter, node, query);
    for children in node.typed_children.values() {
        for &child in children.values() {
            reduce_node(document, child, query, slots);
        }
    }
    call(slots, Visit::Leave, node, query);
}

fn call(slots: &mut [&mut ReducerSlot], visit: Visit, node: &ir::Node, query: &Query) {
    for slot in slots.iter_mut() {
        if slot.error.is_some() {
            continue;
        }
        if let Err(error) = slot.reducer.call(visit, node, query) {
            tracing::debug!(%error, "reducer halted");
            slot.error = Some(error);
        }
    }
}

/// Runs `reducers` over every operation of `query`. Returns one result per reducer, in order.
#[tracing::instrument(skip_all)]
pub fn analyze_ir(query: &Query, reducers: Vec<Box<dyn QueryReducer>>) -> Vec<AnalysisResult> {
    let mut slots: Vec<ReducerSlot> = reducers.into_iter().map(ReducerSlot::new).collect();
    for slot in &mut slots {
        slot.skipped = !slot.reducer.analyze(query);
    }
    if query.is_valid() {
        let mut runnable: Vec<&mut ReducerSlot> =
            slots.iter_mut().filter(|slot| !slot.skipped).collect();
        reduce_query(query, &mut runnable);
    }
    slots.iter_mut().map(ReducerSlot::final_value).collect()
}

/// Runs `reducers` over every valid query. Their errors are added to every query.
#[tracing::instrument(skip_all, fields(queries = queries.len()))]
pub fn analyze_ir_multiplex(
    queries: &mut [Query],
    reducers: Vec<Box<dyn QueryReducer>>,
) -> Vec<AnalysisResult> {
    let mut slots: Vec<ReducerSlot> = reducers.into_iter().map(ReducerSlot::new).collect();
    for query in queries.iter().filter(|query| query.is_valid()) {
        let mut runnable: Vec<&mut ReducerSlot> = slots
            .iter_mut()
            .filter(|slot| slot.reducer.analyze(query))
            .collect();
        reduce_query(query, &mut runnable);
    }
    let results: Vec<AnalysisResult> = slots.iter_mut().map(ReducerSlot::final_value).collect();
    for error in results.iter().filter_map(|result| result.as_ref().err()) {
        for query in queries.iter_mut() {
            query.add_analysis_error(error.clone());
        }
    }
    results
}

/// Query complexity over the rewritten document.
///
/// Each field costs its [`Complexity`](crate::schema::Complexity) given the cost of its
/// children: the most expensive object type's set of child selections. Queries of a
/// multiplex add up.
#[derive(Default)]
pub struct IrComplexity {
    /// Costs of the selections made so far, per owner type, one entry per open field.
    stack: Vec<IndexMap<Name, u64>>,
    totals: Vec<u64>,
}

impl IrComplexity {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_query(&mut self) {
        if let Some(base) = self.stack.pop() {
            self.totals.push(max_possible_complexity(&base));
        }
        self.stack.clear();
    }
}

fn max_possible_complexity(per_type: &IndexMap<Name, u64>) -> u64 {
    per_type.values().copied().max().unwrap_or(0)
}

impl QueryReducer for IrComplexity {
    fn initial_value(&mut self, _query: &Query) {
        self.finish_query();
        self.stack.push(IndexMap::new());
    }

    fn call(&mut self, visit: Visit, node: &ir::Node, query: &Query) -> Result<(), AnalysisError> {
        let (Some(definition), Some(ast_node)) = (node.definition(), node.ast_nodes.first()) else {
            return Ok(());
        };
        match visit {
            Visit::Enter => self.stack.push(IndexMap::new()),
            Visit::Leave => {
                let children = self
                    .stack
                    .pop()
                    .map(|per_type| max_possible_complexity(&per_type))
                    .unwrap_or(0);
                let arguments: Object = coerce_arguments(
                    query.schema(),
                    &definition.arguments,
                    &ast_node.arguments,
                    query.variables(),
                );
                let own = query
                    .schema()
                    .complexity(&node.owner_type, &node.definition_name)
                    .cloned()
                    .unwrap_or_default()
                    .compute(query.context(), &arguments, children);
                if let Some(parent) = self.stack.last_mut() {
                    let total = parent.entry(node.owner_type.clone()).or_default();
                    *total = total.saturating_add(own);
                }
            }
        }
        Ok(())
    }

    fn final_value(&mut self) -> AnalysisResult {
        self.finish_query();
        let total = self.totals.iter().copied().fold(0, u64::saturating_add);
        tracing::debug!(total, queries = self.totals.len(), "ir complexity");
        Ok(Value::from(total))
    }
}
