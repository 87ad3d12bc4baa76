//! The batching runner.
//!
//! Each field is resolved once for every object at its position: a query's root selections
//! spawn one job per response key, and every field returning objects spawns the jobs of the
//! next level when it completes. Jobs run on the multiplex's [`Dataloader`], so loads made by
//! sibling fields are batched together and lazy results are forced breadth first.
//!
//! Errors are recorded where they happen and the response is assembled at the end, nulls
//! bubbling up from the recorded error paths only.
mod field_resolve_step;
mod prepare_object_step;
mod result;
mod selections_step;

use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use futures::FutureExt;
use indexmap::IndexMap;

use self::field_resolve_step::FieldStep;
use self::field_resolve_step::resolve_field;
use self::result::Entry;
use self::result::Place;
use self::result::ResultId;
use self::result::ResultTree;
use self::selections_step::SelectionsStep;
use self::selections_step::execute_selections;
use self::selections_step::gather_selections;
use crate::analysis::analyze_multiplex;
use crate::dataloader::Dataloader;
use crate::dataloader::Job;
use crate::error::ExecutionError;
use crate::error::FieldError;
use crate::graphql;
use crate::graphql::Location;
use crate::graphql::Request;
use crate::graphql::Response;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::query::Query;
use crate::schema::Schema;
use crate::schema::UnauthorizedObject;

/// How resolver results are turned into response values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BuildStrategy {
    /// Every value is completed against its schema type.
    Complete,
    /// [`Resolved::Raw`](crate::schema::Resolved::Raw) values are written as they are.
    RawValue,
}

/// The state of one query while its jobs run.
pub(crate) struct QueryRun {
    query: Query,
    strategy: BuildStrategy,
    operation_label: String,
    tree: RefCell<ResultTree>,
    root: ResultId,
    errors: RefCell<Vec<graphql::Error>>,
    error_paths: RefCell<Vec<Path>>,
}

impl QueryRun {
    fn new(query: Query) -> Self {
        let (tree, root) = ResultTree::new();
        let strategy = if query.schema().configuration().execution.raw_value {
            BuildStrategy::RawValue
        } else {
            BuildStrategy::Complete
        };
        QueryRun {
            operation_label: query.operation_label(),
            query,
            strategy,
            tree: RefCell::new(tree),
            root,
            errors: RefCell::default(),
            error_paths: RefCell::default(),
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    pub(crate) fn raw_values(&self) -> bool {
        self.strategy == BuildStrategy::RawValue
    }

    fn dataloader(&self) -> &Dataloader {
        self.query.context().dataloader()
    }

    pub(crate) fn spawn(&self, job: Job) {
        self.dataloader().append_job(job);
    }

    /// Runs `job` once every lazy value shallower than `depth` was forced.
    pub(crate) fn defer(&self, depth: usize, job: Job) {
        self.dataloader().lazy_at_depth(depth, job);
    }

    pub(crate) fn tree_mut(&self) -> RefMut<'_, ResultTree> {
        self.tree.borrow_mut()
    }

    pub(crate) fn write(&self, place: &Place, entry: Entry, non_null: bool) {
        self.tree.borrow_mut().set(place, entry, non_null);
    }

    /// Records `error` at `place`, which renders as `null`.
    pub(crate) fn add_error(
        &self,
        error: FieldError,
        place: &Place,
        non_null: bool,
        locations: Vec<Location>,
    ) {
        let path = {
            let mut tree = self.tree.borrow_mut();
            tree.set(place, Entry::Error, non_null);
            tree.path(place)
        };
        tracing::debug!(%path, message = %error.message, "field error");
        self.errors.borrow_mut().push(error.into_graphql_error(
            &self.operation_label,
            Some(path.clone()),
            locations,
        ));
        self.error_paths.borrow_mut().push(path);
    }

    /// The response: recorded errors, then data with nulls propagated.
    fn finish(&self) -> Response {
        let data = {
            let mut tree = self.tree.borrow_mut();
            let error_paths = self.error_paths.borrow();
            if tree.propagate_errors(self.root, &error_paths) {
                tree.to_value(self.root)
            } else {
                Value::Null
            }
        };
        Response::builder()
            .data(data)
            .errors(std::mem::take(&mut *self.errors.borrow_mut()))
            .build()
    }

    /// The jobs executing the operation, one group per isolated run.
    ///
    /// A query is a single group. Every root field of a mutation is a group of its own, so
    /// each one (and everything it loads) completes before the next one starts.
    fn root_groups(self: &Rc<Self>, root_value: Value) -> Vec<Vec<Job>> {
        let (Some(operation), Some(root_type)) = (self.query.operation(), self.query.root_type())
        else {
            return Vec::new();
        };
        let root_type = root_type.to_string();
        let objects: Rc<[Value]> = Rc::from(vec![root_value]);
        let results: Rc<[ResultId]> = Rc::from(vec![self.root]);

        if !self.query.is_mutation() {
            let run = self.clone();
            let step = SelectionsStep {
                parent_type: root_type,
                selections: operation.selection_set.clone(),
                objects,
                results,
                path: Path::empty(),
            };
            let job: Job = async move {
                execute_selections(&run, step);
                Ok(())
            }
            .boxed_local();
            return vec![vec![job]];
        }

        let fields = gather_selections(self, &root_type, &operation.selection_set);
        {
            let mut tree = self.tree.borrow_mut();
            for key in fields.keys() {
                tree.reserve(self.root, key);
            }
        }
        fields
            .into_iter()
            .map(|(key, nodes)| {
                vec![resolve_field(
                    self.clone(),
                    FieldStep {
                        parent_type: root_type.clone(),
                        path: Path::empty().join(key.as_str()),
                        key,
                        nodes,
                        objects: objects.clone(),
                        results: results.clone(),
                    },
                )]
            })
            .collect()
    }
}

/// The outcome of checking a query's root object before execution.
enum RootAccess {
    Granted(Value),
    Rejected(Response),
}

/// Authorizes the root value against the operation's root type.
///
/// A rejected root goes through the `unauthorized_object` hook: a replacement object is
/// executed instead, otherwise the response is empty. Errors raised on the way replace the
/// whole response.
async fn authorize_root(query: &Query) -> Result<RootAccess, ExecutionError> {
    let root_value = query.root_value().clone();
    let Some(root_type) = query.root_type() else {
        return Ok(RootAccess::Granted(root_value));
    };
    let schema = query.schema();
    let authorization = schema.authorized(root_type, &root_value, query.context());
    let authorization = match authorization.now() {
        Some(authorization) => authorization,
        None => query
            .context()
            .dataloader()
            .run_isolated(move || authorization.resolve())
            .await
            .map_err(ExecutionError::from_dataloader)?,
    };
    let rejected = |error: FieldError| {
        let error = error.into_graphql_error(&query.operation_label(), None, Vec::new());
        Response::builder().data(Value::Null).error(error).build()
    };
    match authorization {
        Ok(true) => Ok(RootAccess::Granted(root_value)),
        Ok(false) => {
            let unauthorized = UnauthorizedObject {
                type_name: root_type.to_string(),
                object: root_value,
            };
            tracing::debug!(root_type = %root_type, "root object failed authorization");
            match schema.unauthorized_object(&unauthorized, query.context()) {
                Ok(Some(replacement)) => Ok(RootAccess::Granted(replacement)),
                Ok(None) => Ok(RootAccess::Rejected(Response::default())),
                Err(error) => Ok(RootAccess::Rejected(rejected(error))),
            }
        }
        Err(error) => Ok(RootAccess::Rejected(rejected(error))),
    }
}

enum Outcome {
    Done(Response),
    Running(Rc<QueryRun>),
}

impl Schema {
    /// Executes a single request. See [`Schema::multiplex`].
    pub fn execute(&self, request: Request) -> Result<Response, ExecutionError> {
        futures::executor::block_on(self.execute_async(request))
    }

    /// Executes a single request. Required when the dataloader is `nonblocking`.
    pub async fn execute_async(&self, request: Request) -> Result<Response, ExecutionError> {
        let mut responses = self.multiplex_async(vec![request]).await?;
        Ok(responses.pop().unwrap_or_default())
    }

    /// Executes `requests` together, sharing one dataloader. Returns one response per request,
    /// in order.
    ///
    /// Queries failing validation or analysis get a response made of errors only, the others
    /// still run.
    pub fn multiplex(&self, requests: Vec<Request>) -> Result<Vec<Response>, ExecutionError> {
        futures::executor::block_on(self.multiplex_async(requests))
    }

    #[tracing::instrument(skip_all, fields(queries = requests.len()))]
    pub async fn multiplex_async(
        &self,
        requests: Vec<Request>,
    ) -> Result<Vec<Response>, ExecutionError> {
        let dataloader = Dataloader::new(&self.configuration().dataloader)?;
        let mut queries = requests
            .into_iter()
            .map(|request| Query::new(self, request, &dataloader))
            .collect::<Result<Vec<_>, _>>()?;
        analyze_multiplex(&mut queries, self.multiplex_analyzers());

        let mut outcomes = Vec::with_capacity(queries.len());
        let mut groups: IndexMap<usize, Vec<Job>> = IndexMap::new();
        for query in queries {
            if !query.is_executable() {
                tracing::debug!(
                    operation = ?query.operation_name(),
                    errors = query.validation_errors().len() + query.analysis_errors().len(),
                    "query is not executed"
                );
                outcomes.push(Outcome::Done(Response::from_errors(query.static_errors())));
                continue;
            }
            match authorize_root(&query).await? {
                RootAccess::Rejected(response) => outcomes.push(Outcome::Done(response)),
                RootAccess::Granted(root_value) => {
                    let run = Rc::new(QueryRun::new(query));
                    for (index, jobs) in run.root_groups(root_value).into_iter().enumerate() {
                        groups.entry(index).or_default().extend(jobs);
                    }
                    outcomes.push(Outcome::Running(run));
                }
            }
        }

        groups.sort_keys();
        for (index, jobs) in groups {
            tracing::debug!(group = index, jobs = jobs.len(), "running group");
            for job in jobs {
                dataloader.append_job(job);
            }
            dataloader
                .run_async()
                .await
                .map_err(ExecutionError::from_dataloader)?;
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Outcome::Done(response) => response,
                Outcome::Running(run) => run.finish(),
            })
            .collect())
    }
}
