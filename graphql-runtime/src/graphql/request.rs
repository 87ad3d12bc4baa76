use derivative::Derivative;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::json_ext::Object;

/// A GraphQL `Request`: one entry of a multiplex.
#[derive(Clone, Derivative, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[derivative(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Request {
    /// The GraphQL operation (e.g., query, mutation) string.
    pub query: String,

    /// The (optional) GraphQL operation name.
    ///
    /// When specified, this name must match the name of an operation in the
    /// GraphQL document.  When excluded, there must exist only a single
    /// operation in the GraphQL document.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,

    /// The (optional) GraphQL variables in the form of a JSON object.
    #[serde(
        skip_serializing_if = "Object::is_empty",
        default,
        deserialize_with = "deserialize_null_default"
    )]
    pub variables: Object,

    /// The root value handed to root field resolvers.
    #[serde(skip)]
    #[derivative(PartialEq = "ignore")]
    pub root_value: Value,

    /// Initial entries of the query's [`Context`](crate::Context).
    #[serde(skip)]
    #[derivative(PartialEq = "ignore")]
    pub context: Object,
}

#[buildstructor::buildstructor]
impl Request {
    /// Returns a builder that builds a [`Request`] from its components.
    ///
    /// `.query(..)` is required; `.operation_name(..)`, `.variables(..)`/`.variable(k, v)`,
    /// `.root_value(..)` and `.context_entries(..)`/`.context_entry(k, v)` are optional.
    #[builder(visibility = "pub")]
    fn new(
        query: String,
        operation_name: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        variables: JsonMap<ByteString, Value>,
        root_value: Option<Value>,
        context_entries: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
            root_value: root_value.unwrap_or_else(|| Value::Object(Object::new())),
            context: context_entries,
        }
    }
}

// NOTE: this deserialize helper is used to transform `null` to Default::default()
fn deserialize_null_default<'de, D, T: Default + Deserialize<'de>>(
    deserializer: D,
) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<T>>::deserialize(deserializer).map(|x| x.unwrap_or_default())
}
