use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;

use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// A GraphQL response for one query of a multiplex.
///
/// `data` is left out entirely when execution never started (validation or analysis failures,
/// a rejected root object); `errors` is left out when empty.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            errors,
            data,
            extensions,
        }
    }

    /// A response made only of errors, with no `data` member.
    pub(crate) fn from_errors(errors: Vec<Error>) -> Self {
        Self {
            errors,
            ..Default::default()
        }
    }

    /// Serializes into a JSON value, handy for comparisons in tests.
    pub fn to_value(&self) -> Value {
        serde_json_bytes::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn test_empty_errors_are_omitted() {
        let response = Response::builder().data(json!({ "a": 1 })).build();
        assert_eq!(response.to_value(), json!({ "data": { "a": 1 } }));

        let response = Response::from_errors(vec![Error::builder().message("nope").build()]);
        assert_eq!(response.to_value(), json!({ "errors": [{ "message": "nope" }] }));

        assert_eq!(Response::default().to_value(), json!({}));
    }
}
