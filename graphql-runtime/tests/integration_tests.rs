use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::str::FromStr;

use async_trait::async_trait;
use graphql_runtime::Configuration;
use graphql_runtime::FieldError;
use graphql_runtime::Request;
use graphql_runtime::Resolved;
use graphql_runtime::Schema;
use graphql_runtime::SchemaBuilder;
use graphql_runtime::Source;
use graphql_runtime::error::BoxError;
use graphql_runtime::json_ext::Value;
use insta::assert_snapshot;
use pretty_assertions::assert_eq;
use serde_json_bytes::json;
use test_log::test;

const SCHEMA: &str = r#"
type Query {
  cheese(id: Int!): Cheese
  cheeses(ids: [Int!]!): [Cheese]
  flavor(id: Int!): String
}

type Mutation {
  addPlant: Int
}

type Cheese {
  id: Int!
  flavor: String
  similar: Cheese
}
"#;

fn cheese(id: i64) -> Value {
    match id {
        1 => json!({ "id": 1, "flavor": "Brie", "similarId": 3 }),
        2 => json!({ "id": 2, "flavor": "Gouda", "similarId": 4 }),
        3 => json!({ "id": 3, "flavor": "Manchego", "similarId": 1 }),
        4 => json!({ "id": 4, "flavor": "Comté", "secret": true, "similarId": 2 }),
        _ => Value::Null,
    }
}

type Batches = Rc<RefCell<Vec<Vec<i64>>>>;

/// Loads cheeses by id and records every batch.
struct CheeseSource {
    batches: Batches,
}

#[async_trait(?Send)]
impl Source for CheeseSource {
    type Key = i64;
    type Value = Value;

    async fn fetch(&self, keys: &[i64]) -> Result<Vec<Value>, BoxError> {
        self.batches.borrow_mut().push(keys.to_vec());
        Ok(keys.iter().map(|id| cheese(*id)).collect())
    }
}

struct FailingSource;

#[async_trait(?Send)]
impl Source for FailingSource {
    type Key = i64;
    type Value = Value;

    async fn fetch(&self, _keys: &[i64]) -> Result<Vec<Value>, BoxError> {
        Err("the cellar is closed".into())
    }
}

fn id_argument(arguments: &graphql_runtime::json_ext::Object) -> i64 {
    arguments
        .get("id")
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

/// Cheeses loaded through [`CheeseSource`], by `id`, `ids` or `similarId`.
fn cheese_schema(batches: &Batches) -> SchemaBuilder {
    let (by_id, by_ids, similar) = (batches.clone(), batches.clone(), batches.clone());
    Schema::builder(SCHEMA)
        .resolve("Query", "cheese", move |info, _| {
            info.context
                .dataloader()
                .with(CheeseSource {
                    batches: by_id.clone(),
                })
                .request(id_argument(info.arguments))
        })
        .resolve("Query", "cheeses", move |info, _| {
            let ids = info
                .arguments
                .get("ids")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            info.context
                .dataloader()
                .with(CheeseSource {
                    batches: by_ids.clone(),
                })
                .request_all(ids)
        })
        .resolver("Cheese", "similar", move |info, cheeses| {
            let handle = info.context.dataloader().with(CheeseSource {
                batches: similar.clone(),
            });
            cheeses
                .iter()
                .map(|cheese| {
                    match cheese.as_object().and_then(|cheese| cheese.get("similarId")) {
                        Some(id) => handle.request(id.as_i64().unwrap_or_default()).into(),
                        None => Resolved::null(),
                    }
                })
                .collect()
        })
}

fn request(query: &str) -> Request {
    Request::builder().query(query).build()
}

#[test]
fn multiplexed_queries_share_batches() {
    let batches = Batches::default();
    let schema = cheese_schema(&batches).build().unwrap();
    let responses = schema
        .multiplex(vec![
            request("{ a: cheese(id: 1) { flavor } b: cheese(id: 2) { flavor } }"),
            request("{ cheese(id: 3) { flavor } }"),
        ])
        .unwrap();

    assert_eq!(
        responses[0].to_value(),
        json!({ "data": { "a": { "flavor": "Brie" }, "b": { "flavor": "Gouda" } } })
    );
    assert_eq!(
        responses[1].to_value(),
        json!({ "data": { "cheese": { "flavor": "Manchego" } } })
    );
    let mut batches = batches.borrow().clone();
    assert_eq!(batches.len(), 1);
    batches[0].sort();
    assert_eq!(batches[0], vec![1, 2, 3]);
}

#[test]
fn nested_loads_are_batched_level_by_level() {
    let batches = Batches::default();
    let schema = cheese_schema(&batches).build().unwrap();
    let response = schema
        .execute(request(
            "{ cheeses(ids: [1, 2]) { flavor similar { flavor similar { id } } } }",
        ))
        .unwrap();

    assert_eq!(
        response.to_value(),
        json!({ "data": { "cheeses": [
            { "flavor": "Brie", "similar": { "flavor": "Manchego", "similar": { "id": 1 } } },
            { "flavor": "Gouda", "similar": { "flavor": "Comté", "similar": { "id": 2 } } },
        ] } })
    );
    // the third level is served from the cache
    assert_eq!(*batches.borrow(), vec![vec![1, 2], vec![3, 4]]);
}

#[test]
fn invalid_queries_only_get_errors() {
    let batches = Batches::default();
    let schema = cheese_schema(&batches).build().unwrap();
    let responses = schema
        .multiplex(vec![
            request("{ cheese(id: 1) { nope } }"),
            request("{ cheese(id: 1) { flavor } "),
            request("{ cheese(id: 2) { flavor } }"),
        ])
        .unwrap();

    assert_eq!(
        responses[0].to_value(),
        json!({ "errors": [{
            "message": "Field 'nope' doesn't exist on type 'Cheese'",
            "locations": [{ "line": 1, "column": 19 }],
            "extensions": { "code": "GRAPHQL_VALIDATION_FAILED" },
        }] })
    );
    assert_eq!(responses[1].data, None);
    assert_eq!(
        responses[1].errors[0].extensions.get("code"),
        Some(&json!("GRAPHQL_PARSE_FAILED"))
    );
    assert_eq!(
        responses[2].to_value(),
        json!({ "data": { "cheese": { "flavor": "Gouda" } } })
    );
}

#[test]
fn limits_reject_queries_before_execution() {
    let batches = Batches::default();
    let configuration = Configuration::from_str("limits:\n  max_depth: 2\n").unwrap();
    let schema = cheese_schema(&batches)
        .configuration(configuration)
        .build()
        .unwrap();
    let responses = schema
        .multiplex(vec![
            request("{ cheese(id: 1) { similar { similar { id } } } }"),
            request("{ cheese(id: 1) { id } }"),
        ])
        .unwrap();

    assert_eq!(responses[0].data, None);
    assert_eq!(
        responses[0].errors[0].extensions.get("code"),
        Some(&json!("MAX_DEPTH_LIMIT"))
    );
    assert_eq!(responses[1].to_value(), json!({ "data": { "cheese": { "id": 1 } } }));
    assert!(batches.borrow().iter().all(|batch| batch == &vec![1]));
}

#[test]
fn load_errors_name_the_failing_field() {
    let schema = Schema::builder(SCHEMA)
        .resolve("Query", "flavor", |info, _| {
            info.context
                .dataloader()
                .with(FailingSource)
                .request(id_argument(info.arguments))
        })
        .build()
        .unwrap();
    let response = schema
        .execute(request("query GetFlavors { a: flavor(id: 1) b: flavor(id: 2) }"))
        .unwrap();

    assert_eq!(response.data, Some(json!({ "a": null, "b": null })));
    let messages: Vec<&str> = response
        .errors
        .iter()
        .map(|error| error.message.as_str())
        .collect();
    assert_eq!(
        messages,
        vec![
            "Error from FailingSource#fetch(1, 2) at GetFlavors.a, the cellar is closed",
            "Error from FailingSource#fetch(1, 2) at GetFlavors.b, the cellar is closed",
        ]
    );
}

/// Counts plants when fetched, so each mutation sees the effects of the previous ones.
struct PlantCount {
    count: Rc<Cell<i64>>,
}

#[async_trait(?Send)]
impl Source for PlantCount {
    type Key = String;
    type Value = i64;

    async fn fetch(&self, keys: &[String]) -> Result<Vec<i64>, BoxError> {
        Ok(vec![self.count.get(); keys.len()])
    }
}

#[test]
fn mutation_fields_run_one_after_the_other() {
    let count = Rc::new(Cell::new(1));
    let plants = count.clone();
    let schema = Schema::builder(SCHEMA)
        .resolve("Mutation", "addPlant", move |info, _| {
            plants.set(plants.get() + 1);
            info.context
                .dataloader()
                .with(PlantCount {
                    count: plants.clone(),
                })
                .request(info.path.to_string())
                .then(|count| count.map(Value::from))
        })
        .build()
        .unwrap();
    let response = schema
        .execute(request("mutation { a: addPlant b: addPlant c: addPlant }"))
        .unwrap();

    assert_eq!(
        response.to_value(),
        json!({ "data": { "a": 2, "b": 3, "c": 4 } })
    );
    assert_eq!(count.get(), 4);
}

fn is_secret(cheese: &Value) -> bool {
    cheese
        .as_object()
        .and_then(|cheese| cheese.get("secret"))
        .and_then(Value::as_bool)
        .unwrap_or_default()
}

#[test]
fn unauthorized_objects_are_nulled_with_an_error() {
    let batches = Batches::default();
    let schema = cheese_schema(&batches)
        .authorize_type("Cheese", |cheese, _| !is_secret(cheese))
        .build()
        .unwrap();
    let response = schema
        .execute(request("{ cheeses(ids: [2, 4]) { id } }"))
        .unwrap();

    assert_eq!(
        response.to_value(),
        json!({
            "errors": [{
                "message": "An object failed Cheese's authorization check",
                "locations": [{ "line": 1, "column": 3 }],
                "path": ["cheeses", 1],
            }],
            "data": { "cheeses": [{ "id": 2 }, null] },
        })
    );
}

#[test]
fn lazy_authorization_waits_for_its_loads() {
    let batches = Batches::default();
    let checks = batches.clone();
    let schema = cheese_schema(&batches)
        .authorize_type("Cheese", move |cheese, context| {
            let id = cheese
                .as_object()
                .and_then(|cheese| cheese.get("id"))
                .and_then(Value::as_i64)
                .unwrap_or_default();
            context
                .dataloader()
                .with(CheeseSource {
                    batches: checks.clone(),
                })
                .request(id)
                .then(|loaded| {
                    loaded
                        .map(|cheese| !is_secret(&cheese))
                        .map_err(FieldError::from)
                })
        })
        .unauthorized_object(|unauthorized, _| {
            Ok(Some(json!({ "id": 0, "flavor": format!("hidden {}", unauthorized.type_name) })))
        })
        .build()
        .unwrap();
    let response = schema
        .execute(request("{ cheeses(ids: [1, 4]) { id flavor } }"))
        .unwrap();

    assert_eq!(
        response.to_value(),
        json!({ "data": { "cheeses": [
            { "id": 1, "flavor": "Brie" },
            { "id": 0, "flavor": "hidden Cheese" },
        ] } })
    );
}

#[test]
fn unauthorized_fields_are_null() {
    let batches = Batches::default();
    let schema = cheese_schema(&batches)
        .authorize_field("Cheese", "flavor", |_, _, context| context.contains_key("admin"))
        .build()
        .unwrap();

    let response = schema
        .execute(request("{ cheese(id: 1) { id flavor } }"))
        .unwrap();
    assert_eq!(
        response.to_value(),
        json!({ "data": { "cheese": { "id": 1, "flavor": null } } })
    );

    let response = schema
        .execute(
            Request::builder()
                .query("{ cheese(id: 1) { id flavor } }")
                .context_entry("admin", json!(true))
                .build(),
        )
        .unwrap();
    assert_eq!(
        response.to_value(),
        json!({ "data": { "cheese": { "id": 1, "flavor": "Brie" } } })
    );
}

#[test]
fn rejected_roots_return_an_empty_response() {
    let batches = Batches::default();
    let schema = cheese_schema(&batches)
        .authorize_type("Query", |_, context| context.contains_key("user"))
        .build()
        .unwrap();
    let response = schema.execute(request("{ cheese(id: 1) { id } }")).unwrap();
    assert_eq!(response.to_value(), json!({}));
    assert!(batches.borrow().is_empty());
}

#[test]
fn rejected_roots_may_raise() {
    let schema = Schema::builder(SCHEMA)
        .authorize_type("Query", |_, _| false)
        .unauthorized_object(|unauthorized, _| Err(FieldError::new(unauthorized.message())))
        .build()
        .unwrap();
    let response = schema.execute(request("{ flavor(id: 1) }")).unwrap();
    assert_eq!(
        response.to_value(),
        json!({
            "errors": [{ "message": "An object failed Query's authorization check" }],
            "data": null,
        })
    );
}

/// Allows everything, once fetched.
struct Allow;

#[async_trait(?Send)]
impl Source for Allow {
    type Key = ();
    type Value = bool;

    async fn fetch(&self, keys: &[()]) -> Result<Vec<bool>, BoxError> {
        Ok(vec![true; keys.len()])
    }
}

#[test]
fn lazy_root_authorization() {
    let schema = Schema::builder(SCHEMA)
        .authorize_type("Query", |_, context| {
            context
                .dataloader()
                .with(Allow)
                .request(())
                .then(|allowed| allowed.map_err(FieldError::from))
        })
        .resolve("Query", "flavor", |_, _| json!("Brie"))
        .build()
        .unwrap();
    let response = schema.execute(request("{ flavor(id: 1) }")).unwrap();
    assert_eq!(response.to_value(), json!({ "data": { "flavor": "Brie" } }));
}

fn raw_schema(configuration: &str) -> Schema {
    Schema::builder(SCHEMA)
        .configuration(Configuration::from_str(configuration).unwrap())
        .resolve("Query", "flavor", |_, _| Resolved::Raw(json!({ "name": "Brie" })))
        .build()
        .unwrap()
}

#[test]
fn raw_values_skip_completion_when_enabled() {
    let response = raw_schema("execution:\n  raw_value: true\n")
        .execute(request("{ flavor(id: 1) }"))
        .unwrap();
    assert_eq!(
        response.to_value(),
        json!({ "data": { "flavor": { "name": "Brie" } } })
    );

    let response = raw_schema("{}").execute(request("{ flavor(id: 1) }")).unwrap();
    assert_eq!(response.to_value(), json!({ "data": { "flavor": null } }));
}

#[test]
fn resolvers_must_return_one_result_per_object() {
    let schema = Schema::builder(SCHEMA)
        .resolve("Query", "cheese", |_, _| json!({ "id": 1 }))
        .resolver("Cheese", "flavor", |_, _| Vec::new())
        .build()
        .unwrap();
    let error = schema
        .execute(request("{ cheese(id: 1) { flavor } }"))
        .unwrap_err();
    assert_snapshot!(error.to_string(), @"resolver for Cheese.flavor returned 0 results for 1 objects");
}

#[test]
fn operations_are_selected_by_name() {
    let schema = Schema::builder(SCHEMA)
        .resolve("Query", "flavor", |info, _| {
            json!(format!("flavor {}", id_argument(info.arguments)))
        })
        .build()
        .unwrap();
    let document = "query A { flavor(id: 1) } query B($id: Int = 2) { flavor(id: $id) }";
    let response = schema
        .execute(
            Request::builder()
                .query(document)
                .operation_name("B")
                .build(),
        )
        .unwrap();
    assert_eq!(response.to_value(), json!({ "data": { "flavor": "flavor 2" } }));

    let response = schema.execute(request(document)).unwrap();
    assert_snapshot!(response.errors[0].message.as_str(), @"An operation name is required");
}

#[tokio::test]
async fn nonblocking_execution() {
    let batches = Batches::default();
    let configuration = Configuration::from_str("dataloader:\n  nonblocking: true\n").unwrap();
    let schema = cheese_schema(&batches)
        .configuration(configuration)
        .build()
        .unwrap();
    let response = schema
        .execute_async(request("{ cheese(id: 2) { flavor } }"))
        .await
        .unwrap();
    assert_eq!(
        response.to_value(),
        json!({ "data": { "cheese": { "flavor": "Gouda" } } })
    );
}
