use apollo_compiler::ast;

use crate::json_ext::Object;
use crate::json_ext::Value;

/// Whether `@skip` and `@include` let a selection through.
///
/// Only an explicit `true` skips and only an explicit `false` excludes: a missing variable
/// leaves the selection in.
pub(crate) fn directives_include(directives: &ast::DirectiveList, variables: &Object) -> bool {
    directives.iter().all(|directive| {
        let condition = directive
            .arguments
            .iter()
            .find(|argument| argument.name == "if")
            .and_then(|argument| condition_value(&argument.value, variables));
        match directive.name.as_str() {
            "skip" => condition != Some(true),
            "include" => condition != Some(false),
            _ => true,
        }
    })
}

fn condition_value(value: &ast::Value, variables: &Object) -> Option<bool> {
    match value {
        ast::Value::Boolean(value) => Some(*value),
        ast::Value::Variable(name) => variables.get(name.as_str()).and_then(Value::as_bool),
        _ => None,
    }
}
