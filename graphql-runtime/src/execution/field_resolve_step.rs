use std::rc::Rc;

use apollo_compiler::Node;
use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::FieldDefinition;
use futures::FutureExt;

use super::QueryRun;
use super::prepare_object_step::PendingObject;
use super::prepare_object_step::handle_unauthorized;
use super::prepare_object_step::prepare_objects;
use super::result::Entry;
use super::result::Place;
use super::result::ResultId;
use crate::dataloader::Job;
use crate::error::DataloaderError;
use crate::error::ExecutionError;
use crate::error::FieldError;
use crate::graphql::Location;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::query::coerce_arguments;
use crate::schema::ResolveInfo;
use crate::schema::Resolved;
use crate::schema::Schema;
use crate::schema::UnauthorizedObject;
use crate::schema::default_resolver;

/// One response key of a selection, resolved for every object of a batch.
pub(crate) struct FieldStep {
    pub(crate) parent_type: String,
    pub(crate) key: String,
    /// Every node selecting this key, in document order.
    pub(crate) nodes: Vec<Node<ast::Field>>,
    pub(crate) objects: Rc<[Value]>,
    pub(crate) results: Rc<[ResultId]>,
    /// Response keys down to this field.
    pub(crate) path: Path,
}

/// What the completion of a field's results needs to know about the field.
pub(crate) struct FieldContext {
    pub(crate) parent_type: String,
    pub(crate) definition: Node<FieldDefinition>,
    pub(crate) nodes: Vec<Node<ast::Field>>,
    pub(crate) locations: Vec<Location>,
    pub(crate) path: Path,
}

impl FieldContext {
    fn invalid_null(&self, ty: &ast::Type, in_list: bool) -> FieldError {
        if in_list {
            FieldError::new(format!(
                "Cannot return null for non-nullable element of type '{ty}' for {}.{}",
                self.parent_type, self.definition.name
            ))
        } else {
            FieldError::new(format!(
                "Cannot return null for non-nullable field {}.{}",
                self.parent_type, self.definition.name
            ))
        }
    }

    /// Writes `null` at `place`, or an error when `ty` does not allow it.
    pub(crate) fn complete_null(
        &self,
        run: &QueryRun,
        place: &Place,
        ty: &ast::Type,
        in_list: bool,
    ) {
        if ty.is_non_null() {
            run.add_error(
                self.invalid_null(ty, in_list),
                place,
                true,
                self.locations.clone(),
            );
        } else {
            run.write(place, Entry::Null, false);
        }
    }
}

/// Resolves a field for its whole batch: authorization, arguments, the resolver, then the
/// completion of every result.
pub(crate) fn resolve_field(run: Rc<QueryRun>, step: FieldStep) -> Job {
    async move {
        let query = run.query();
        let schema = query.schema();
        let Some(first) = step.nodes.first() else {
            return Ok(());
        };
        let Some(definition) = schema.get_field(&step.parent_type, &first.name).cloned() else {
            return Err(DataloaderError::job(ExecutionError::UnknownField {
                type_name: step.parent_type.clone(),
                field: first.name.to_string(),
            }));
        };
        let places: Vec<Place> = step
            .results
            .iter()
            .map(|&object| Place::Field {
                object,
                key: step.key.clone(),
            })
            .collect();
        let field = Rc::new(FieldContext {
            parent_type: step.parent_type.clone(),
            locations: query.locations(&step.nodes),
            nodes: step.nodes.clone(),
            definition,
            path: step.path.clone(),
        });

        if field.definition.name.as_str() == "__typename" {
            let resolved = places
                .into_iter()
                .map(|place| (place, Resolved::from(Value::from(field.parent_type.as_str()))))
                .collect();
            return build_results(&run, &field, resolved);
        }

        let arguments = coerce_arguments(
            schema,
            &field.definition.arguments,
            &first.arguments,
            query.variables(),
        );

        let (objects, places) = match schema.field_authorizer(&field.parent_type, &first.name) {
            None => (step.objects.clone(), places),
            Some(authorizer) => {
                let mut objects = Vec::with_capacity(places.len());
                let mut authorized = Vec::with_capacity(places.len());
                for (object, place) in step.objects.iter().zip(places) {
                    let authorization = authorizer(object, &arguments, query.context())
                        .resolve()
                        .await;
                    match authorization {
                        Ok(true) => {
                            objects.push(object.clone());
                            authorized.push(place);
                        }
                        Ok(false) => field.complete_null(&run, &place, &field.definition.ty, false),
                        Err(error) => run.add_error(
                            error,
                            &place,
                            field.definition.ty.is_non_null(),
                            field.locations.clone(),
                        ),
                    }
                }
                (Rc::from(objects), authorized)
            }
        };
        if objects.is_empty() {
            return Ok(());
        }

        let info = ResolveInfo {
            parent_type: &field.parent_type,
            field_name: &field.definition.name,
            arguments: &arguments,
            context: query.context(),
            path: &field.path,
        };
        let results = match schema.resolver(&field.parent_type, &first.name) {
            Some(resolver) => resolver(&info, &objects[..]),
            None => default_resolver(&info, &objects[..]),
        };
        if results.len() != objects.len() {
            return Err(DataloaderError::job(ExecutionError::ResolverResultCount {
                type_name: field.parent_type.clone(),
                field: field.definition.name.to_string(),
                expected: objects.len(),
                actual: results.len(),
            }));
        }
        let resolved: Vec<(Place, Resolved)> = places.into_iter().zip(results).collect();

        if resolved.iter().any(|(_, resolved)| resolved.is_lazy()) {
            let deferred = run.clone();
            run.defer(
                field.path.len(),
                async move {
                    let mut synced = Vec::with_capacity(resolved.len());
                    for (place, resolved) in resolved {
                        synced.push((place, resolved.sync().await));
                    }
                    build_results(&deferred, &field, synced)
                }
                .boxed_local(),
            );
            return Ok(());
        }
        build_results(&run, &field, resolved)
    }
    .boxed_local()
}

/// Writes leaves into the response and hands objects over to be prepared.
fn build_results(
    run: &Rc<QueryRun>,
    field: &Rc<FieldContext>,
    resolved: Vec<(Place, Resolved)>,
) -> Result<(), DataloaderError> {
    let mut pending = Vec::new();
    let ty = field.definition.ty.clone();
    for (place, resolved) in resolved {
        complete_value(run, field, place, resolved, &ty, false, &mut pending);
    }
    if pending.is_empty() {
        return Ok(());
    }
    prepare_objects(run.clone(), field.clone(), pending)
}

fn complete_value(
    run: &QueryRun,
    field: &FieldContext,
    place: Place,
    resolved: Resolved,
    ty: &ast::Type,
    in_list: bool,
    pending: &mut Vec<PendingObject>,
) {
    match resolved {
        Resolved::Lazy(lazy) => {
            // synced before results are built
            let resolved = lazy.value().unwrap_or_else(Resolved::null);
            complete_value(run, field, place, resolved, ty, in_list, pending);
        }
        Resolved::Error(error) => {
            run.add_error(error, &place, ty.is_non_null(), field.locations.clone());
        }
        Resolved::Raw(value) if run.raw_values() => {
            run.write(&place, Entry::Leaf(value), ty.is_non_null());
        }
        Resolved::Raw(value) | Resolved::Value(value) => {
            complete_json(run, field, place, value, ty, in_list, false, pending);
        }
        Resolved::List(items) => complete_list(run, field, place, items, ty, pending),
        Resolved::Unauthorized => {
            let unauthorized = UnauthorizedObject {
                type_name: ty.inner_named_type().to_string(),
                object: Value::Null,
            };
            if let Some(replacement) =
                handle_unauthorized(run, field, &place, unauthorized, ty, in_list)
            {
                complete_json(run, field, place, replacement, ty, in_list, true, pending);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn complete_json(
    run: &QueryRun,
    field: &FieldContext,
    place: Place,
    value: Value,
    ty: &ast::Type,
    in_list: bool,
    authorized: bool,
    pending: &mut Vec<PendingObject>,
) {
    if value.is_null() {
        field.complete_null(run, &place, ty, in_list);
        return;
    }
    if ty.is_list() {
        match value {
            Value::Array(items) => {
                let items = items.into_iter().map(Resolved::Value).collect();
                complete_list(run, field, place, items, ty, pending);
            }
            _ => field.complete_null(run, &place, ty, in_list),
        }
        return;
    }
    let schema = run.query().schema();
    let type_name = ty.inner_named_type();
    match schema.get_type(type_name) {
        Some(ExtendedType::Object(_) | ExtendedType::Interface(_) | ExtendedType::Union(_)) => {
            pending.push(PendingObject {
                place,
                object: value,
                ty: ty.clone(),
                in_list,
                authorized,
            });
        }
        _ => match coerce_leaf(schema, type_name, &value) {
            Some(leaf) => run.write(&place, Entry::Leaf(leaf), ty.is_non_null()),
            None => {
                tracing::debug!(%type_name, "leaf value could not be coerced");
                field.complete_null(run, &place, ty, in_list);
            }
        },
    }
}

fn complete_list(
    run: &QueryRun,
    field: &FieldContext,
    place: Place,
    items: Vec<Resolved>,
    ty: &ast::Type,
    pending: &mut Vec<PendingObject>,
) {
    let item_type = match ty {
        ast::Type::List(item_type) | ast::Type::NonNullList(item_type) => item_type.as_ref(),
        _ => {
            field.complete_null(run, &place, ty, false);
            return;
        }
    };
    let list = {
        let mut tree = run.tree_mut();
        let path = tree.path(&place);
        let list = tree.list(path, items.len(), item_type.is_non_null());
        tree.set(&place, Entry::List(list), ty.is_non_null());
        list
    };
    for (index, item) in items.into_iter().enumerate() {
        let place = Place::Item { list, index };
        complete_value(run, field, place, item, item_type, true, pending);
    }
}

/// Coerces a leaf value to its scalar or enum type, `None` when it does not fit.
///
/// Custom scalars are passed through untouched.
fn coerce_leaf(schema: &Schema, type_name: &str, value: &Value) -> Option<Value> {
    match type_name {
        "Int" => value
            .as_i64()
            .or_else(|| {
                value
                    .as_f64()
                    .filter(|float| float.fract() == 0.0)
                    .map(|float| float as i64)
            })
            .and_then(|int| i32::try_from(int).ok())
            .map(Value::from),
        "Float" => value.as_f64().map(Value::from),
        "String" => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(number) => Some(Value::from(number.to_string())),
            Value::Bool(boolean) => Some(Value::from(boolean.to_string())),
            _ => None,
        },
        "Boolean" => value.as_bool().map(Value::Bool),
        "ID" => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(number) if number.is_i64() || number.is_u64() => {
                Some(Value::from(number.to_string()))
            }
            _ => None,
        },
        _ => match schema.get_type(type_name) {
            Some(ExtendedType::Enum(enum_type)) => value
                .as_str()
                .filter(|name| enum_type.values.contains_key(*name))
                .map(|_| value.clone()),
            _ => Some(value.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json_bytes::json;

    use super::*;

    #[rstest]
    #[case::int_from_integral_float("Int", json!(4.0), Some(json!(4)))]
    #[case::int_out_of_range("Int", json!(2_147_483_648i64), None)]
    #[case::int_from_string("Int", json!("4"), None)]
    #[case::float_from_int("Float", json!(1), Some(json!(1.0)))]
    #[case::string_from_bool("String", json!(true), Some(json!("true")))]
    #[case::id_from_int("ID", json!(7), Some(json!("7")))]
    #[case::id_from_float("ID", json!(7.5), None)]
    #[case::known_enum("Color", json!("RED"), Some(json!("RED")))]
    #[case::unknown_enum("Color", json!("BLUE"), None)]
    #[case::custom_scalar("Json", json!({ "a": [1] }), Some(json!({ "a": [1] })))]
    fn leaves_fit_their_type(
        #[case] type_name: &str,
        #[case] value: Value,
        #[case] expected: Option<Value>,
    ) {
        let schema =
            Schema::parse("scalar Json enum Color { RED } type Query { a: Json b: Color }")
                .unwrap();
        assert_eq!(coerce_leaf(&schema, type_name, &value), expected);
    }
}
