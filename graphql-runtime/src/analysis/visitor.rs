use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::schema::DirectiveDefinition;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::InputValueDefinition;

use super::Slot;
use crate::error::AnalysisError;
use crate::json_ext::Object;
use crate::query::Query;
use crate::query::coerce_arguments;
use crate::query::directives_include;
use crate::schema::Schema;
use crate::type_environment::TypeEnvironment;

use super::Analyzer;

/// Where the traversal of the selected operation currently is.
///
/// Fragment spreads are visited inline, once per spread, so a fragment spread at two depths
/// is seen at both.
pub struct Visitor<'a> {
    query: &'a Query,
    env: TypeEnvironment,
    response_path: Vec<String>,
    skip_stack: Vec<bool>,
    fragment_stack: Vec<Name>,
}

impl<'a> Visitor<'a> {
    fn new(query: &'a Query) -> Self {
        Visitor {
            query,
            env: TypeEnvironment::new(query.schema()),
            response_path: Vec::new(),
            skip_stack: Vec::new(),
            fragment_stack: Vec::new(),
        }
    }

    pub fn query(&self) -> &'a Query {
        self.query
    }

    pub fn schema(&self) -> &'a Schema {
        self.query.schema()
    }

    /// The type of the current field's value, or the type entered by the last fragment.
    pub fn type_definition(&self) -> Option<&Name> {
        self.env.current_type_definition()
    }

    /// The type the current field is selected on.
    pub fn parent_type_definition(&self) -> Option<&Name> {
        self.env.parent_type_definition()
    }

    pub fn field_definition(&self) -> Option<&Node<FieldDefinition>> {
        self.env.current_field_definition()
    }

    pub fn previous_field_definition(&self) -> Option<&Node<FieldDefinition>> {
        self.env.previous_field_definition()
    }

    pub fn directive_definition(&self) -> Option<&Node<DirectiveDefinition>> {
        self.env.current_directive_definition()
    }

    pub fn argument_definition(&self) -> Option<&Node<InputValueDefinition>> {
        self.env.current_argument_definition()
    }

    pub fn previous_argument_definition(&self) -> Option<&Node<InputValueDefinition>> {
        self.env.previous_argument_definition()
    }

    /// Response keys from the root to the current field.
    pub fn response_path(&self) -> &[String] {
        &self.response_path
    }

    /// Whether the current field, or one of its ancestors, is excluded by `@skip`/`@include`.
    pub fn skipping(&self) -> bool {
        self.skip_stack.last().copied().unwrap_or(false)
    }

    /// The coerced arguments of `field`, which must be the current field.
    pub fn arguments_for(&self, field: &ast::Field) -> Object {
        match self.field_definition() {
            Some(definition) => coerce_arguments(
                self.schema(),
                &definition.arguments,
                &field.arguments,
                self.query.variables(),
            ),
            None => Object::new(),
        }
    }
}

/// Visits the selected operation of `query`, calling every analyzer in `slots`.
///
/// An analyzer returning an error is not called again: the error becomes its result.
pub(super) fn visit(query: &Query, slots: &mut [&mut Slot]) {
    let Some(operation) = query.operation() else {
        return;
    };
    let mut walk = Walk {
        visitor: Visitor::new(query),
        slots,
    };
    walk.operation(operation);
}

struct Walk<'a, 's, 't> {
    visitor: Visitor<'a>,
    slots: &'s mut [&'t mut Slot],
}

impl Walk<'_, '_, '_> {
    fn call(
        &mut self,
        callback: impl Fn(&mut dyn Analyzer, &Visitor<'_>) -> Result<(), AnalysisError>,
    ) {
        let visitor = &self.visitor;
        for slot in self.slots.iter_mut() {
            if slot.error.is_some() {
                continue;
            }
            if let Err(error) = callback(slot.analyzer.as_mut(), visitor) {
                tracing::debug!(%error, "analyzer halted");
                slot.error = Some(error);
            }
        }
    }

    fn operation(&mut self, operation: &Node<ast::OperationDefinition>) {
        self.visitor.env.enter_operation(operation.operation_type);
        self.call(|analyzer, visitor| analyzer.on_enter_operation_definition(operation, visitor));
        self.directives(&operation.directives);
        self.selection_set(&operation.selection_set);
        self.call(|analyzer, visitor| analyzer.on_leave_operation_definition(operation, visitor));
        self.visitor.env.leave_type_condition();
    }

    fn selection_set(&mut self, selections: &[ast::Selection]) {
        for selection in selections {
            match selection {
                ast::Selection::Field(field) => self.field(field),
                ast::Selection::InlineFragment(inline) => self.inline_fragment(inline),
                ast::Selection::FragmentSpread(spread) => self.fragment_spread(spread),
            }
        }
    }

    fn field(&mut self, field: &Node<ast::Field>) {
        let key = field.alias.as_ref().unwrap_or(&field.name);
        self.visitor.response_path.push(key.to_string());
        self.visitor.env.enter_field(&field.name);
        let skipping = self.visitor.skipping()
            || !directives_include(&field.directives, self.visitor.query.variables());
        self.visitor.skip_stack.push(skipping);

        self.call(|analyzer, visitor| analyzer.on_enter_field(field, visitor));
        self.arguments(&field.arguments);
        self.directives(&field.directives);
        self.selection_set(&field.selection_set);
        self.call(|analyzer, visitor| analyzer.on_leave_field(field, visitor));

        self.visitor.skip_stack.pop();
        self.visitor.env.leave_field();
        self.visitor.response_path.pop();
    }

    fn inline_fragment(&mut self, inline: &Node<ast::InlineFragment>) {
        self.visitor
            .env
            .enter_type_condition(inline.type_condition.as_ref());
        self.call(|analyzer, visitor| analyzer.on_enter_inline_fragment(inline, visitor));
        self.directives(&inline.directives);
        self.selection_set(&inline.selection_set);
        self.call(|analyzer, visitor| analyzer.on_leave_inline_fragment(inline, visitor));
        self.visitor.env.leave_type_condition();
    }

    fn fragment_spread(&mut self, spread: &Node<ast::FragmentSpread>) {
        let query = self.visitor.query;
        self.call(|analyzer, visitor| analyzer.on_enter_fragment_spread(spread, visitor));
        self.directives(&spread.directives);
        let fragment = query
            .fragment(&spread.fragment_name)
            .filter(|fragment| !self.visitor.fragment_stack.contains(&fragment.name));
        if let Some(fragment) = fragment {
            self.visitor.fragment_stack.push(fragment.name.clone());
            self.visitor
                .env
                .enter_type_condition(Some(&fragment.type_condition));
            self.selection_set(&fragment.selection_set);
            self.visitor.env.leave_type_condition();
            self.visitor.fragment_stack.pop();
        }
        self.call(|analyzer, visitor| analyzer.on_leave_fragment_spread(spread, visitor));
    }

    fn directives(&mut self, directives: &ast::DirectiveList) {
        for directive in directives.iter() {
            self.visitor.env.enter_directive(&directive.name);
            self.call(|analyzer, visitor| analyzer.on_enter_directive(directive, visitor));
            self.arguments(&directive.arguments);
            self.call(|analyzer, visitor| analyzer.on_leave_directive(directive, visitor));
            self.visitor.env.leave_directive();
        }
    }

    fn arguments(&mut self, arguments: &[Node<ast::Argument>]) {
        for argument in arguments {
            self.argument(&argument.name, &argument.value);
        }
    }

    /// Visits an argument, or a field of an input object literal.
    fn argument(&mut self, name: &Name, value: &Node<ast::Value>) {
        self.visitor.env.enter_argument(name);
        self.call(|analyzer, visitor| analyzer.on_enter_argument(name, value, visitor));
        self.input_value(value);
        self.call(|analyzer, visitor| analyzer.on_leave_argument(name, value, visitor));
        self.visitor.env.leave_argument();
    }

    fn input_value(&mut self, value: &ast::Value) {
        match value {
            ast::Value::Object(fields) => {
                for (name, value) in fields {
                    self.argument(name, value);
                }
            }
            ast::Value::List(items) => {
                for item in items {
                    self.input_value(item);
                }
            }
            _ => {}
        }
    }
}
