use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::schema::ExtendedType;
use serde_json_bytes::json;

use super::AnalysisResult;
use super::Analyzer;
use super::Visitor;
use super::query_complexity::ScopeTree;
use super::query_complexity::ScopedField;
use super::query_depth::INTROSPECTION_FIELDS;
use crate::error::AnalysisError;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::schema::Schema;

/// Fields which never cost anything.
const ZERO_COST_FIELDS: &[&str] = &[
    "address",
    "billingAddress",
    "currencyFormats",
    "measurement",
    "unitCost",
    "pageInfo",
];

const MUTATION_COST: u64 = 10;
const CONNECTION_COST: u64 = 2;
const MAX_CONNECTION_SIZE: i64 = 250;

/// A cost model for storefront-style schemas.
///
/// Objects cost 1, scalars are free and mutations cost 10 regardless of their selections.
/// Connections (types named `*Connection`) multiply the cost of their selections by a
/// factor growing with the logarithm of the requested page size.
///
/// Introspection fields and their selections are free.
///
/// The result is `{ "total": .., "fields": [..] }`, `fields` listing the cost of every field,
/// leaves first.
#[derive(Default)]
pub struct ShopifyComplexity {
    trees: Vec<ScopeTree>,
    introspection_depth: usize,
}

impl ShopifyComplexity {
    pub fn new() -> Self {
        Self::default()
    }
}

fn field_cost(schema: &Schema, field: &ScopedField, children: u64) -> u64 {
    let Some(definition) = &field.definition else {
        return children;
    };
    if ZERO_COST_FIELDS.contains(&definition.name.as_str()) {
        return 0;
    }
    let mutation_root = schema.root_type(OperationType::Mutation);
    if field.parent_type.is_some() && field.parent_type.as_ref() == mutation_root {
        return MUTATION_COST;
    }
    let return_type = definition.ty.inner_named_type();
    if return_type.ends_with("Connection") {
        return connection_multiplier(&field.arguments)
            .saturating_mul(children)
            .saturating_add(CONNECTION_COST);
    }
    match schema.get_type(return_type) {
        Some(ExtendedType::Object(_) | ExtendedType::Interface(_) | ExtendedType::Union(_)) => {
            children.saturating_add(1)
        }
        _ => children,
    }
}

/// `floor(2 ln(size))`, the page size being the largest `first` (or `last`) requested.
fn connection_multiplier(arguments: &[Object]) -> u64 {
    let mut sizing: i64 = 1;
    for arguments in arguments {
        let requested = ["first", "last"]
            .iter()
            .find_map(|name| arguments.get(*name).filter(|value| !value.is_null()))
            .and_then(Value::as_i64);
        if let Some(requested) = requested {
            sizing = sizing.max(requested);
        }
    }
    let sizing = sizing.min(MAX_CONNECTION_SIZE);
    if sizing == 0 {
        return 0;
    }
    (2.0 * (sizing.max(2) as f64).ln()).floor() as u64
}

impl Analyzer for ShopifyComplexity {
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
        if self.introspection_depth > 0 || INTROSPECTION_FIELDS.contains(&field.name.as_str()) {
            self.introspection_depth += 1;
        } else if let Some(tree) = self.trees.last_mut() {
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
        if self.introspection_depth > 0 {
            self.introspection_depth -= 1;
        } else if let Some(tree) = self.trees.last_mut() {
            tree.leave();
        }
        Ok(())
    }

    fn result(&mut self) -> AnalysisResult {
        let mut fields = Vec::new();
        let mut total: u64 = 0;
        for tree in &self.trees {
            let cost = tree.total(&mut |schema, _, field, children| {
                let cost = field_cost(schema, field, children);
                if field.definition.is_some() {
                    fields.push(json!({
                        "path": field.response_path,
                        "definedCost": 0,
                        "requestedTotalCost": cost,
                        "requestedChildrenCost": children,
                    }));
                }
                cost
            });
            total = total.saturating_add(cost);
        }
        tracing::debug!(total, fields = fields.len(), "shopify complexity");
        Ok(json!({ "total": total, "fields": fields }))
    }
}
