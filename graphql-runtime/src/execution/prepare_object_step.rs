//! Objects returned by a field go through three stages before their selections run: their
//! runtime type is resolved, they are authorized, then their result objects are created.
//! The first two may wait on lazy values, in which case the rest is deferred at the
//! field's depth.
use std::rc::Rc;

use apollo_compiler::ast;
use futures::FutureExt;
use indexmap::IndexMap;

use super::QueryRun;
use super::field_resolve_step::FieldContext;
use super::result::Entry;
use super::result::Place;
use super::result::ResultId;
use super::selections_step::SelectionsStep;
use super::selections_step::execute_selections;
use crate::error::DataloaderError;
use crate::error::ExecutionError;
use crate::error::FieldError;
use crate::json_ext::Value;
use crate::schema::Authorization;
use crate::schema::MaybeLazy;
use crate::schema::UnauthorizedObject;

/// An object returned for a field, waiting for its result object.
pub(crate) struct PendingObject {
    pub(crate) place: Place,
    pub(crate) object: Value,
    /// The type of the position, list wrappers removed.
    pub(crate) ty: ast::Type,
    pub(crate) in_list: bool,
    /// Replacements from the `unauthorized_object` hook are not checked again.
    pub(crate) authorized: bool,
}

/// The values of `lazies`, or `None` if one of them is still pending.
fn all_now<T: Clone + 'static>(lazies: &[MaybeLazy<T>]) -> Option<Vec<T>> {
    lazies.iter().map(MaybeLazy::now).collect()
}

async fn resolve_all<T: Clone + 'static>(lazies: Vec<MaybeLazy<T>>) -> Vec<T> {
    let mut values = Vec::with_capacity(lazies.len());
    for lazy in lazies {
        values.push(lazy.resolve().await);
    }
    values
}

pub(crate) fn prepare_objects(
    run: Rc<QueryRun>,
    field: Rc<FieldContext>,
    objects: Vec<PendingObject>,
) -> Result<(), DataloaderError> {
    let query = run.query();
    let schema = query.schema();
    let static_type = field.definition.ty.inner_named_type();
    let mut types = Vec::with_capacity(objects.len());
    for pending in &objects {
        if !schema.is_abstract(static_type) {
            types.push(MaybeLazy::Ready(static_type.to_string()));
            continue;
        }
        match schema.resolve_type(static_type, &pending.object, query.context()) {
            Some(runtime_type) => types.push(runtime_type),
            None => {
                return Err(DataloaderError::job(ExecutionError::MissingTypeResolver(
                    static_type.to_string(),
                )));
            }
        }
    }
    if let Some(types) = all_now(&types) {
        return authorize_objects(run, field, objects, types);
    }
    let deferred = run.clone();
    run.defer(
        field.path.len(),
        async move {
            let types = resolve_all(types).await;
            authorize_objects(deferred, field, objects, types)
        }
        .boxed_local(),
    );
    Ok(())
}

fn authorize_objects(
    run: Rc<QueryRun>,
    field: Rc<FieldContext>,
    objects: Vec<PendingObject>,
    types: Vec<String>,
) -> Result<(), DataloaderError> {
    let query = run.query();
    let schema = query.schema();
    let static_type = field.definition.ty.inner_named_type();
    let possible_types = schema.possible_types(static_type);
    if let Some(runtime_type) = types.iter().find(|runtime_type| {
        !possible_types
            .iter()
            .any(|possible| possible.as_str() == runtime_type.as_str())
    }) {
        return Err(DataloaderError::job(ExecutionError::InvalidRuntimeType {
            abstract_type: static_type.to_string(),
            runtime_type: runtime_type.clone(),
        }));
    }

    let authorizations: Vec<MaybeLazy<Authorization>> = objects
        .iter()
        .zip(&types)
        .map(|(pending, runtime_type)| {
            if pending.authorized || !schema.has_type_authorizers() {
                MaybeLazy::Ready(Ok(true))
            } else {
                schema.authorized(runtime_type, &pending.object, query.context())
            }
        })
        .collect();
    if let Some(authorizations) = all_now(&authorizations) {
        return create_results(&run, &field, objects, types, authorizations);
    }
    let deferred = run.clone();
    run.defer(
        field.path.len(),
        async move {
            let authorizations = resolve_all(authorizations).await;
            create_results(&deferred, &field, objects, types, authorizations)
        }
        .boxed_local(),
    );
    Ok(())
}

/// Creates the result object of every authorized object, then runs the field's selections
/// once per runtime type.
fn create_results(
    run: &Rc<QueryRun>,
    field: &FieldContext,
    objects: Vec<PendingObject>,
    types: Vec<String>,
    authorizations: Vec<Authorization>,
) -> Result<(), DataloaderError> {
    let mut batches: IndexMap<String, (Vec<Value>, Vec<ResultId>)> = IndexMap::new();
    for ((pending, runtime_type), authorization) in objects.into_iter().zip(types).zip(authorizations)
    {
        let object = match authorization {
            Ok(true) => Some(pending.object),
            Ok(false) => handle_unauthorized(
                run,
                field,
                &pending.place,
                UnauthorizedObject {
                    type_name: runtime_type.clone(),
                    object: pending.object,
                },
                &pending.ty,
                pending.in_list,
            ),
            Err(error) => {
                run.add_error(
                    error,
                    &pending.place,
                    pending.ty.is_non_null(),
                    field.locations.clone(),
                );
                None
            }
        };
        let Some(object) = object else {
            continue;
        };
        let result = {
            let mut tree = run.tree_mut();
            let path = tree.path(&pending.place);
            let result = tree.object(path);
            tree.set(&pending.place, Entry::Object(result), pending.ty.is_non_null());
            result
        };
        let batch = batches.entry(runtime_type).or_default();
        batch.0.push(object);
        batch.1.push(result);
    }

    let selections: Vec<ast::Selection> = field
        .nodes
        .iter()
        .flat_map(|node| node.selection_set.iter().cloned())
        .collect();
    for (runtime_type, (objects, results)) in batches {
        tracing::trace!(%runtime_type, objects = objects.len(), path = %field.path, "executing selections");
        execute_selections(
            run,
            SelectionsStep {
                parent_type: runtime_type,
                selections: selections.clone(),
                objects: Rc::from(objects),
                results: Rc::from(results),
                path: field.path.clone(),
            },
        );
    }
    Ok(())
}

/// Hands an object which failed authorization to the `unauthorized_object` hook.
///
/// Returns the replacement object, if any. Otherwise `null` and an error are written at
/// `place`: the authorization error in a nullable position, a non-null error in a non-null
/// one.
pub(crate) fn handle_unauthorized(
    run: &QueryRun,
    field: &FieldContext,
    place: &Place,
    unauthorized: UnauthorizedObject,
    ty: &ast::Type,
    in_list: bool,
) -> Option<Value> {
    let query = run.query();
    let error = match query
        .schema()
        .unauthorized_object(&unauthorized, query.context())
    {
        Ok(Some(replacement)) => return Some(replacement),
        Ok(None) => FieldError::new(unauthorized.message()),
        Err(error) => error,
    };
    tracing::debug!(type_name = %unauthorized.type_name, path = %field.path, "object failed authorization");
    if ty.is_non_null() {
        field.complete_null(run, place, ty, in_list);
    } else {
        run.add_error(error, place, false, field.locations.clone());
    }
    None
}
