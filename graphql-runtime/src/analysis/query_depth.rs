use apollo_compiler::Node;
use apollo_compiler::ast;

use super::AnalysisResult;
use super::Analyzer;
use super::Visitor;
use crate::error::AnalysisError;
use crate::json_ext::Value;

pub(super) const INTROSPECTION_FIELDS: &[&str] = &["__typename", "__schema", "__type"];

/// The deepest field nesting of the visited operations.
///
/// Skipped fields don't count, and neither do introspection fields nor anything below them
/// unless `count_introspection_fields` is set.
#[derive(Default)]
pub struct QueryDepth {
    count_introspection_fields: bool,
    max_depth: usize,
    current_depth: usize,
    introspection_depth: usize,
}

impl QueryDepth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_introspection_fields(mut self, count: bool) -> Self {
        self.count_introspection_fields = count;
        self
    }

    pub fn depth(&self) -> usize {
        self.max_depth
    }

    fn is_uncounted(&self, field: &ast::Field) -> bool {
        !self.count_introspection_fields && INTROSPECTION_FIELDS.contains(&field.name.as_str())
    }
}

impl Analyzer for QueryDepth {
    fn on_enter_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        if visitor.skipping() {
            return Ok(());
        }
        if self.is_uncounted(field) || self.introspection_depth > 0 {
            self.introspection_depth += 1;
        } else {
            self.current_depth += 1;
            self.max_depth = self.max_depth.max(self.current_depth);
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
        } else {
            self.current_depth = self.current_depth.saturating_sub(1);
        }
        Ok(())
    }

    fn result(&mut self) -> AnalysisResult {
        Ok(Value::from(self.max_depth))
    }
}

/// Fails queries nested deeper than `max`.
pub struct MaxQueryDepth {
    depth: QueryDepth,
    max: usize,
    warn_only: bool,
}

impl MaxQueryDepth {
    pub fn new(max: usize) -> Self {
        MaxQueryDepth {
            depth: QueryDepth::new(),
            max,
            warn_only: false,
        }
    }

    pub fn count_introspection_fields(mut self, count: bool) -> Self {
        self.depth = self.depth.count_introspection_fields(count);
        self
    }

    /// Logs a warning instead of failing.
    pub fn warn_only(mut self, warn_only: bool) -> Self {
        self.warn_only = warn_only;
        self
    }
}

impl Analyzer for MaxQueryDepth {
    fn on_enter_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        self.depth.on_enter_field(field, visitor)
    }

    fn on_leave_field(
        &mut self,
        field: &Node<ast::Field>,
        visitor: &Visitor<'_>,
    ) -> Result<(), AnalysisError> {
        self.depth.on_leave_field(field, visitor)
    }

    fn result(&mut self) -> AnalysisResult {
        let actual = self.depth.depth();
        if actual <= self.max {
            return Ok(Value::Null);
        }
        if self.warn_only {
            tracing::warn!(actual, max = self.max, "query depth exceeds the limit");
            return Ok(Value::Null);
        }
        Err(AnalysisError::MaxDepth {
            actual,
            max: self.max,
        })
    }
}
