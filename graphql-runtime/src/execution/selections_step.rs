use std::rc::Rc;

use apollo_compiler::Node;
use apollo_compiler::ast;
use indexmap::IndexMap;
use indexmap::IndexSet;

use super::QueryRun;
use super::field_resolve_step::FieldStep;
use super::field_resolve_step::resolve_field;
use super::result::ResultId;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::query::directives_include;

/// The selections of one object type, made on every object of a batch.
pub(crate) struct SelectionsStep {
    pub(crate) parent_type: String,
    pub(crate) selections: Vec<ast::Selection>,
    pub(crate) objects: Rc<[Value]>,
    /// The result object of each object, in the same order.
    pub(crate) results: Rc<[ResultId]>,
    pub(crate) path: Path,
}

/// Reserves the response keys of the selections in every result object, then spawns one
/// field job per key.
pub(crate) fn execute_selections(run: &Rc<QueryRun>, step: SelectionsStep) {
    let fields = gather_selections(run, &step.parent_type, &step.selections);
    {
        let mut tree = run.tree_mut();
        for &result in step.results.iter() {
            for key in fields.keys() {
                tree.reserve(result, key);
            }
        }
    }
    for (key, nodes) in fields {
        let field = FieldStep {
            parent_type: step.parent_type.clone(),
            path: step.path.join(key.as_str()),
            key,
            nodes,
            objects: step.objects.clone(),
            results: step.results.clone(),
        };
        run.spawn(resolve_field(run.clone(), field));
    }
}

/// The fields selected on objects of `parent_type`, grouped by response key.
///
/// Fragments apply when their type condition does, `@skip` and `@include` are evaluated on
/// every node.
pub(crate) fn gather_selections(
    run: &QueryRun,
    parent_type: &str,
    selections: &[ast::Selection],
) -> IndexMap<String, Vec<Node<ast::Field>>> {
    let mut fields = IndexMap::new();
    gather_into(run, parent_type, selections, &mut fields, &mut IndexSet::new());
    fields
}

fn gather_into(
    run: &QueryRun,
    parent_type: &str,
    selections: &[ast::Selection],
    fields: &mut IndexMap<String, Vec<Node<ast::Field>>>,
    spread: &mut IndexSet<String>,
) {
    let query = run.query();
    let schema = query.schema();
    let variables = query.variables();
    let applies = |type_condition: Option<&str>| {
        type_condition.is_none_or(|condition| schema.type_condition_applies(parent_type, condition))
    };
    for selection in selections {
        match selection {
            ast::Selection::Field(field) => {
                if !directives_include(&field.directives, variables) {
                    continue;
                }
                let key = field.alias.as_ref().unwrap_or(&field.name).to_string();
                fields.entry(key).or_default().push(field.clone());
            }
            ast::Selection::InlineFragment(fragment) => {
                if directives_include(&fragment.directives, variables)
                    && applies(fragment.type_condition.as_deref())
                {
                    gather_into(run, parent_type, &fragment.selection_set, fields, spread);
                }
            }
            ast::Selection::FragmentSpread(spread_node) => {
                let name = spread_node.fragment_name.as_str();
                if !directives_include(&spread_node.directives, variables) {
                    continue;
                }
                // cycles are rejected before execution, this only guards the recursion
                if !spread.insert(name.to_string()) {
                    continue;
                }
                if let Some(fragment) = query.fragment(name)
                    && applies(Some(fragment.type_condition.as_str()))
                {
                    gather_into(run, parent_type, &fragment.selection_set, fields, spread);
                }
                spread.shift_remove(name);
            }
        }
    }
}
