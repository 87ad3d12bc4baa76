//! GraphQL schema and the runtime hooks registered against it.

mod resolvers;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast::OperationType;
use apollo_compiler::schema::DirectiveDefinition;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use apollo_compiler::schema::Implementers;
use apollo_compiler::validation::Valid;
pub use resolvers::Authorization;
pub use resolvers::BatchResolver;
pub use resolvers::Complexity;
pub use resolvers::FieldAuthorizer;
pub use resolvers::MaybeLazy;
pub use resolvers::ResolveInfo;
pub use resolvers::Resolved;
pub use resolvers::TypeAuthorizer;
pub use resolvers::TypeResolver;
pub use resolvers::UnauthorizedObject;
pub use resolvers::UnauthorizedObjectHook;
pub(crate) use resolvers::default_resolver;

use crate::analysis::Analyzer;
use crate::analysis::MaxQueryComplexity;
use crate::analysis::MaxQueryDepth;
use crate::configuration::Configuration;
use crate::context::Context;
use crate::error::FieldError;
use crate::error::SchemaError;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// Builds a fresh analyzer for each query (or each multiplex).
pub type AnalyzerFactory = Rc<dyn Fn() -> Box<dyn Analyzer>>;

/// Hooks registered per type and field.
type FieldMap<T> = HashMap<String, HashMap<String, T>>;

fn lookup<'a, T>(map: &'a FieldMap<T>, type_name: &str, field: &str) -> Option<&'a T> {
    map.get(type_name).and_then(|fields| fields.get(field))
}

fn register<T>(map: &mut FieldMap<T>, type_name: &str, field: &str, value: T) {
    map.entry(type_name.to_string())
        .or_default()
        .insert(field.to_string(), value);
}

/// A validated schema with its resolvers, authorization hooks and analyzers.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Schema {
    inner: Rc<SchemaInner>,
}

struct SchemaInner {
    definitions: Valid<apollo_compiler::Schema>,
    implementers_map: apollo_compiler::collections::HashMap<Name, Implementers>,
    resolvers: FieldMap<BatchResolver>,
    complexities: FieldMap<Complexity>,
    field_authorizers: FieldMap<FieldAuthorizer>,
    type_resolvers: HashMap<String, TypeResolver>,
    type_authorizers: HashMap<String, TypeAuthorizer>,
    unauthorized_object: Option<UnauthorizedObjectHook>,
    query_analyzers: Vec<AnalyzerFactory>,
    multiplex_analyzers: Vec<AnalyzerFactory>,
    configuration: Configuration,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let SchemaInner {
            definitions: _,
            implementers_map,
            resolvers,
            complexities,
            field_authorizers,
            type_resolvers,
            type_authorizers,
            unauthorized_object,
            query_analyzers,
            multiplex_analyzers,
            configuration,
        } = &*self.inner;
        fn count<T>(map: &FieldMap<T>) -> usize {
            map.values().map(HashMap::len).sum()
        }
        f.debug_struct("Schema")
            .field("implementers_map", implementers_map)
            .field("resolvers", &count(resolvers))
            .field("complexities", &count(complexities))
            .field("field_authorizers", &count(field_authorizers))
            .field("type_resolvers", &type_resolvers.keys().collect::<Vec<_>>())
            .field("type_authorizers", &type_authorizers.keys().collect::<Vec<_>>())
            .field("unauthorized_object", &unauthorized_object.is_some())
            .field("query_analyzers", &query_analyzers.len())
            .field("multiplex_analyzers", &multiplex_analyzers.len())
            .field("configuration", configuration)
            .finish()
    }
}

impl Schema {
    /// Starts registering runtime hooks against the schema described by `sdl`.
    pub fn builder(sdl: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            sdl: sdl.into(),
            configuration: Configuration::default(),
            resolvers: FieldMap::new(),
            complexities: FieldMap::new(),
            field_authorizers: FieldMap::new(),
            type_resolvers: HashMap::new(),
            type_authorizers: HashMap::new(),
            unauthorized_object: None,
            query_analyzers: Vec::new(),
            multiplex_analyzers: Vec::new(),
        }
    }

    /// A schema whose fields all use the default resolver.
    pub fn parse(sdl: impl Into<String>) -> Result<Self, SchemaError> {
        Schema::builder(sdl).build()
    }

    pub fn definitions(&self) -> &Valid<apollo_compiler::Schema> {
        &self.inner.definitions
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    /// The root type for `operation_type`, if the schema has one.
    pub fn root_type(&self, operation_type: OperationType) -> Option<&Name> {
        self.inner.definitions.root_operation(operation_type)
    }

    /// The definition of `field` on `type_name`, including `__typename` and friends.
    pub fn get_field(&self, type_name: &str, field: &str) -> Option<&Node<FieldDefinition>> {
        self.inner
            .definitions
            .type_field(type_name, field)
            .ok()
            .map(|component| &component.node)
    }

    pub fn get_type(&self, type_name: &str) -> Option<&ExtendedType> {
        self.inner.definitions.types.get(type_name)
    }

    pub fn directives(&self) -> impl Iterator<Item = (&Name, &Node<DirectiveDefinition>)> {
        self.inner.definitions.directive_definitions.iter()
    }

    /// The object types a value of `type_name` may have at runtime.
    pub fn possible_types(&self, type_name: &str) -> Vec<Name> {
        let definitions = &self.inner.definitions;
        match definitions.types.get_key_value(type_name) {
            Some((name, ExtendedType::Object(_))) => vec![name.clone()],
            Some((name, ExtendedType::Interface(_))) => self
                .inner
                .implementers_map
                .get(name)
                .map(|implementers| implementers.objects.iter().cloned().collect())
                .unwrap_or_default(),
            Some((_, ExtendedType::Union(union_))) => union_
                .members
                .iter()
                .map(|member| member.name.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_abstract(&self, type_name: &str) -> bool {
        matches!(
            self.get_type(type_name),
            Some(ExtendedType::Interface(_) | ExtendedType::Union(_))
        )
    }

    pub fn is_leaf(&self, type_name: &str) -> bool {
        matches!(
            self.get_type(type_name),
            Some(ExtendedType::Scalar(_) | ExtendedType::Enum(_))
        )
    }

    /// Whether selections under a type condition apply to objects of `concrete_type`.
    pub fn type_condition_applies(&self, concrete_type: &str, type_condition: &str) -> bool {
        if concrete_type == type_condition {
            return true;
        }
        let concrete_possible_types = self.possible_types(concrete_type);
        self.possible_types(type_condition)
            .iter()
            .any(|possible_type| concrete_possible_types.contains(possible_type))
    }

    pub(crate) fn resolver(&self, type_name: &str, field: &str) -> Option<&BatchResolver> {
        lookup(&self.inner.resolvers, type_name, field)
    }

    pub(crate) fn complexity(&self, type_name: &str, field: &str) -> Option<&Complexity> {
        lookup(&self.inner.complexities, type_name, field)
    }

    pub(crate) fn field_authorizer(&self, type_name: &str, field: &str) -> Option<&FieldAuthorizer> {
        lookup(&self.inner.field_authorizers, type_name, field)
    }

    pub(crate) fn type_authorizer(&self, type_name: &str) -> Option<&TypeAuthorizer> {
        self.inner.type_authorizers.get(type_name)
    }

    pub(crate) fn has_type_authorizers(&self) -> bool {
        !self.inner.type_authorizers.is_empty()
    }

    /// Resolves the runtime type of `object`.
    ///
    /// Without a registered hook, the object's `__typename` key is used.
    pub(crate) fn resolve_type(
        &self,
        abstract_type: &str,
        object: &Value,
        context: &Context,
    ) -> Option<MaybeLazy<String>> {
        if let Some(type_resolver) = self.inner.type_resolvers.get(abstract_type) {
            return Some(type_resolver(object, context));
        }
        object
            .as_object()
            .and_then(|object| object.get("__typename"))
            .and_then(Value::as_str)
            .map(|type_name| MaybeLazy::Ready(type_name.to_string()))
    }

    /// Authorizes `object` as a `type_name`. Types without an authorizer accept everything.
    pub(crate) fn authorized(
        &self,
        type_name: &str,
        object: &Value,
        context: &Context,
    ) -> MaybeLazy<Authorization> {
        match self.type_authorizer(type_name) {
            Some(authorizer) => authorizer(object, context),
            None => MaybeLazy::Ready(Ok(true)),
        }
    }

    /// Applies the `unauthorized_object` hook. Without one, unauthorized objects are replaced
    /// by `null` and an error.
    pub(crate) fn unauthorized_object(
        &self,
        unauthorized: &UnauthorizedObject,
        context: &Context,
    ) -> Result<Option<Value>, FieldError> {
        match &self.inner.unauthorized_object {
            Some(hook) => hook(unauthorized, context),
            None => Ok(None),
        }
    }

    pub(crate) fn query_analyzers(&self) -> Vec<Box<dyn Analyzer>> {
        self.inner
            .query_analyzers
            .iter()
            .map(|factory| factory())
            .collect()
    }

    pub(crate) fn multiplex_analyzers(&self) -> Vec<Box<dyn Analyzer>> {
        self.inner
            .multiplex_analyzers
            .iter()
            .map(|factory| factory())
            .collect()
    }
}

/// Registers runtime hooks, then validates them against the schema in [`SchemaBuilder::build`].
pub struct SchemaBuilder {
    sdl: String,
    configuration: Configuration,
    resolvers: FieldMap<BatchResolver>,
    complexities: FieldMap<Complexity>,
    field_authorizers: FieldMap<FieldAuthorizer>,
    type_resolvers: HashMap<String, TypeResolver>,
    type_authorizers: HashMap<String, TypeAuthorizer>,
    unauthorized_object: Option<UnauthorizedObjectHook>,
    query_analyzers: Vec<AnalyzerFactory>,
    multiplex_analyzers: Vec<AnalyzerFactory>,
}

impl SchemaBuilder {
    pub fn configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Resolves `type_name.field` for a whole batch of objects at once.
    pub fn resolver(
        mut self,
        type_name: &str,
        field: &str,
        resolver: impl Fn(&ResolveInfo<'_>, &[Value]) -> Vec<Resolved> + 'static,
    ) -> Self {
        register(&mut self.resolvers, type_name, field, Rc::new(resolver));
        self
    }

    /// Resolves `type_name.field` one object at a time.
    pub fn resolve<R: Into<Resolved>>(
        self,
        type_name: &str,
        field: &str,
        resolve: impl Fn(&ResolveInfo<'_>, &Value) -> R + 'static,
    ) -> Self {
        self.resolver(type_name, field, move |info, objects| {
            objects
                .iter()
                .map(|object| resolve(info, object).into())
                .collect()
        })
    }

    pub fn complexity(mut self, type_name: &str, field: &str, complexity: Complexity) -> Self {
        register(&mut self.complexities, type_name, field, complexity);
        self
    }

    pub fn resolve_type<R: Into<MaybeLazy<String>>>(
        mut self,
        abstract_type: &str,
        resolve_type: impl Fn(&Value, &Context) -> R + 'static,
    ) -> Self {
        self.type_resolvers.insert(
            abstract_type.to_string(),
            Rc::new(move |object, context| resolve_type(object, context).into()),
        );
        self
    }

    pub fn authorize_type<R: Into<MaybeLazy<Authorization>>>(
        mut self,
        type_name: &str,
        authorize: impl Fn(&Value, &Context) -> R + 'static,
    ) -> Self {
        self.type_authorizers.insert(
            type_name.to_string(),
            Rc::new(move |object, context| authorize(object, context).into()),
        );
        self
    }

    pub fn authorize_field<R: Into<MaybeLazy<Authorization>>>(
        mut self,
        type_name: &str,
        field: &str,
        authorize: impl Fn(&Value, &Object, &Context) -> R + 'static,
    ) -> Self {
        register(
            &mut self.field_authorizers,
            type_name,
            field,
            Rc::new(move |object: &Value, arguments: &Object, context: &Context| {
                authorize(object, arguments, context).into()
            }),
        );
        self
    }

    pub fn unauthorized_object(
        mut self,
        hook: impl Fn(&UnauthorizedObject, &Context) -> Result<Option<Value>, FieldError> + 'static,
    ) -> Self {
        self.unauthorized_object = Some(Rc::new(hook));
        self
    }

    /// Runs a fresh analyzer over every query before execution.
    pub fn query_analyzer(mut self, factory: impl Fn() -> Box<dyn Analyzer> + 'static) -> Self {
        self.query_analyzers.push(Rc::new(factory));
        self
    }

    /// Runs one analyzer over all the queries of a multiplex.
    pub fn multiplex_analyzer(
        mut self,
        factory: impl Fn() -> Box<dyn Analyzer> + 'static,
    ) -> Self {
        self.multiplex_analyzers.push(Rc::new(factory));
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let SchemaBuilder {
            sdl,
            configuration,
            resolvers,
            complexities,
            field_authorizers,
            type_resolvers,
            type_authorizers,
            unauthorized_object,
            mut query_analyzers,
            multiplex_analyzers,
        } = self;
        let configuration = configuration
            .validate()
            .map_err(|error| SchemaError::Invalid(error.to_string()))?;
        let definitions = apollo_compiler::Schema::parse_and_validate(sdl, "schema.graphql")
            .map_err(|error| SchemaError::Invalid(error.errors.to_string()))?;

        for field_map in [
            field_names(&resolvers),
            field_names(&complexities),
            field_names(&field_authorizers),
        ] {
            for (type_name, field) in field_map {
                if !definitions.types.contains_key(type_name) {
                    return Err(SchemaError::UnknownType(type_name.to_string()));
                }
                if definitions.type_field(type_name, field).is_err() {
                    return Err(SchemaError::UnknownField {
                        type_name: type_name.to_string(),
                        field: field.to_string(),
                    });
                }
            }
        }
        for type_name in type_authorizers.keys() {
            if !definitions.types.contains_key(type_name.as_str()) {
                return Err(SchemaError::UnknownType(type_name.clone()));
            }
        }
        for type_name in type_resolvers.keys() {
            match definitions.types.get(type_name.as_str()) {
                Some(ExtendedType::Interface(_) | ExtendedType::Union(_)) => {}
                Some(_) => return Err(SchemaError::NotAbstract(type_name.clone())),
                None => return Err(SchemaError::UnknownType(type_name.clone())),
            }
        }

        let limits = &configuration.limits;
        if let Some(max) = limits.max_complexity {
            let warn_only = limits.warn_only;
            query_analyzers.push(Rc::new(move || {
                Box::new(MaxQueryComplexity::new(max).warn_only(warn_only)) as Box<dyn Analyzer>
            }));
        }
        if let Some(max) = limits.max_depth {
            let warn_only = limits.warn_only;
            let count_introspection_fields = limits.count_introspection_fields;
            query_analyzers.push(Rc::new(move || {
                Box::new(
                    MaxQueryDepth::new(max)
                        .count_introspection_fields(count_introspection_fields)
                        .warn_only(warn_only),
                ) as Box<dyn Analyzer>
            }));
        }

        let implementers_map = definitions.implementers_map();
        tracing::debug!(
            types = definitions.types.len(),
            query_analyzers = query_analyzers.len(),
            multiplex_analyzers = multiplex_analyzers.len(),
            "schema built"
        );
        Ok(Schema {
            inner: Rc::new(SchemaInner {
                definitions,
                implementers_map,
                resolvers,
                complexities,
                field_authorizers,
                type_resolvers,
                type_authorizers,
                unauthorized_object,
                query_analyzers,
                multiplex_analyzers,
                configuration,
            }),
        })
    }
}

fn field_names<T>(map: &FieldMap<T>) -> Vec<(&str, &str)> {
    map.iter()
        .flat_map(|(type_name, fields)| {
            fields
                .keys()
                .map(move |field| (type_name.as_str(), field.as_str()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::dataloader::Dataloader;

    const SDL: &str = r#"
        type Query {
          node(id: ID!): Node
          search: [SearchResult]
        }
        interface Node { id: ID! }
        type User implements Node { id: ID! name: String }
        type Post implements Node { id: ID! title: String }
        type Comment { body: String }
        union SearchResult = User | Comment
    "#;

    #[test]
    fn possible_types_of_abstract_types() {
        let schema = Schema::parse(SDL).unwrap();
        let names = |type_name: &str| {
            schema
                .possible_types(type_name)
                .iter()
                .map(|name| name.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(names("Node"), vec!["User", "Post"]);
        assert_eq!(names("SearchResult"), vec!["User", "Comment"]);
        assert_eq!(names("User"), vec!["User"]);
        assert!(schema.possible_types("String").is_empty());
        assert!(schema.is_abstract("Node"));
        assert!(!schema.is_abstract("User"));
        assert!(schema.is_leaf("ID"));
    }

    #[test]
    fn debug_counts_registered_hooks() {
        let schema = Schema::builder(SDL)
            .resolve("User", "name", |_, _| Value::Null)
            .resolve("Post", "title", |_, _| Value::Null)
            .complexity("Query", "search", Complexity::Fixed(5))
            .authorize_field("User", "name", |_, _, _| true)
            .build()
            .unwrap();
        let debug = format!("{schema:?}");
        assert!(debug.contains("resolvers: 2"), "{debug}");
        assert!(debug.contains("complexities: 1"), "{debug}");
        assert!(debug.contains("field_authorizers: 1"), "{debug}");
    }

    #[test]
    fn type_conditions_apply_through_shared_possible_types() {
        let schema = Schema::parse(SDL).unwrap();
        assert!(schema.type_condition_applies("User", "User"));
        assert!(schema.type_condition_applies("User", "Node"));
        assert!(schema.type_condition_applies("User", "SearchResult"));
        assert!(!schema.type_condition_applies("Comment", "Node"));
        assert!(!schema.type_condition_applies("Post", "SearchResult"));
    }

    #[test]
    fn meta_fields_are_defined_everywhere() {
        let schema = Schema::parse(SDL).unwrap();
        assert!(schema.get_field("User", "__typename").is_some());
        assert!(schema.get_field("User", "title").is_none());
    }

    #[test]
    fn resolve_type_falls_back_to_typename() {
        let schema = Schema::builder(SDL)
            .resolve_type("SearchResult", |_, _| "Comment")
            .build()
            .unwrap();
        let context = Context::new(Dataloader::default());
        let resolved = schema
            .resolve_type("Node", &json!({ "__typename": "Post" }), &context)
            .unwrap();
        assert!(matches!(resolved, MaybeLazy::Ready(name) if name == "Post"));
        let resolved = schema
            .resolve_type("SearchResult", &json!({}), &context)
            .unwrap();
        assert!(matches!(resolved, MaybeLazy::Ready(name) if name == "Comment"));
        assert!(schema.resolve_type("Node", &json!({}), &context).is_none());
    }

    #[test]
    fn registrations_must_match_the_schema() {
        let error = Schema::builder(SDL)
            .resolve("User", "email", |_, _| json!("x"))
            .build()
            .unwrap_err();
        assert_snapshot!(error.to_string(), @"no field 'User.email' in the schema");

        let error = Schema::builder(SDL)
            .resolve_type("User", |_, _| "User")
            .build()
            .unwrap_err();
        assert_snapshot!(error.to_string(), @"'User' is not an abstract type");

        let error = Schema::builder(SDL)
            .authorize_type("Account", |_, _| true)
            .build()
            .unwrap_err();
        assert_snapshot!(error.to_string(), @"no type named 'Account' in the schema");

        assert!(matches!(
            Schema::parse("type Query { a: Missing }"),
            Err(SchemaError::Invalid(_))
        ));
    }

    #[test]
    fn limits_register_analyzers() {
        let configuration: Configuration = "limits:\n  max_complexity: 5\n  max_depth: 3\n"
            .parse()
            .unwrap();
        let schema = Schema::builder(SDL)
            .configuration(configuration)
            .build()
            .unwrap();
        assert_eq!(schema.query_analyzers().len(), 2);
        assert!(schema.multiplex_analyzers().is_empty());
    }
}
