//! Application hooks called during execution.
use std::fmt;
use std::rc::Rc;

use crate::context::Context;
use crate::dataloader::Lazy;
use crate::error::FieldError;
use crate::error::LoadError;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// What a resolver produced for one object.
#[derive(Clone, Debug)]
pub enum Resolved {
    /// A leaf value, an object to select fields from, or `null`.
    Value(Value),

    /// A list, each item completed against the list's item type.
    List(Vec<Resolved>),

    /// A value which arrives later. Lazy results are completed breadth first.
    Lazy(Lazy<Resolved>),

    /// An error recorded at the path of the field.
    Error(FieldError),

    /// The object must not be seen by the client. Handed to the `unauthorized_object` hook.
    Unauthorized,

    /// Written to the response verbatim when `execution.raw_value` is enabled.
    Raw(Value),
}

impl Resolved {
    pub fn null() -> Self {
        Resolved::Value(Value::Null)
    }

    pub(crate) fn is_lazy(&self) -> bool {
        match self {
            Resolved::Lazy(_) => true,
            Resolved::List(items) => items.iter().any(Resolved::is_lazy),
            _ => false,
        }
    }

    /// Waits for every lazy value in this result, including lazy list items.
    pub(crate) async fn sync(self) -> Resolved {
        let mut resolved = self;
        loop {
            match resolved {
                Resolved::Lazy(lazy) => resolved = lazy.sync().await,
                Resolved::List(items) => {
                    let mut synced = Vec::with_capacity(items.len());
                    for item in items {
                        synced.push(Box::pin(item.sync()).await);
                    }
                    return Resolved::List(synced);
                }
                other => return other,
            }
        }
    }
}

impl From<Value> for Resolved {
    fn from(value: Value) -> Self {
        Resolved::Value(value)
    }
}

impl From<FieldError> for Resolved {
    fn from(error: FieldError) -> Self {
        Resolved::Error(error)
    }
}

impl<T: Into<Resolved>> From<Vec<T>> for Resolved {
    fn from(items: Vec<T>) -> Self {
        Resolved::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Resolved>> From<Option<T>> for Resolved {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_else(Resolved::null)
    }
}

impl<T: Into<Resolved>> From<Result<T, FieldError>> for Resolved {
    fn from(result: Result<T, FieldError>) -> Self {
        result.map(Into::into).unwrap_or_else(Resolved::Error)
    }
}

impl<T: Into<Resolved>> From<Result<T, LoadError>> for Resolved {
    fn from(result: Result<T, LoadError>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(error) => Resolved::Error(error.into()),
        }
    }
}

impl<T: Into<Resolved> + Clone + 'static> From<Lazy<T>> for Resolved {
    fn from(lazy: Lazy<T>) -> Self {
        Resolved::Lazy(lazy.then(Into::into))
    }
}

/// Either a value or a deferred one.
#[derive(Clone, Debug)]
pub enum MaybeLazy<T: 'static> {
    Ready(T),
    Lazy(Lazy<T>),
}

impl<T: Clone + 'static> MaybeLazy<T> {
    pub fn is_lazy(&self) -> bool {
        matches!(self, MaybeLazy::Lazy(lazy) if !lazy.is_synced())
    }

    pub async fn resolve(self) -> T {
        match self {
            MaybeLazy::Ready(value) => value,
            MaybeLazy::Lazy(lazy) => lazy.sync().await,
        }
    }

    /// The value, if it is available without waiting.
    pub(crate) fn now(&self) -> Option<T> {
        match self {
            MaybeLazy::Ready(value) => Some(value.clone()),
            MaybeLazy::Lazy(lazy) => lazy.value(),
        }
    }
}

impl<T> From<Lazy<T>> for MaybeLazy<T> {
    fn from(lazy: Lazy<T>) -> Self {
        MaybeLazy::Lazy(lazy)
    }
}

/// The outcome of an authorization check: `Ok(false)` hides the object, `Err` reports an error.
pub type Authorization = Result<bool, FieldError>;

impl From<bool> for MaybeLazy<Authorization> {
    fn from(authorized: bool) -> Self {
        MaybeLazy::Ready(Ok(authorized))
    }
}

impl From<&str> for MaybeLazy<String> {
    fn from(type_name: &str) -> Self {
        MaybeLazy::Ready(type_name.to_string())
    }
}

/// Everything a resolver knows about the field being resolved.
#[derive(Debug)]
pub struct ResolveInfo<'a> {
    pub parent_type: &'a str,
    pub field_name: &'a str,
    /// Coerced arguments, defaults included.
    pub arguments: &'a Object,
    pub context: &'a Context,
    /// Response keys from the root to this field. List indexes are left out: one call
    /// resolves the field for every object at this position.
    pub path: &'a Path,
}

/// Resolves one field for a batch of objects, returning one result per object.
pub type BatchResolver = Rc<dyn Fn(&ResolveInfo<'_>, &[Value]) -> Vec<Resolved>>;

/// Picks the object type of a value whose static type is an interface or a union.
pub type TypeResolver = Rc<dyn Fn(&Value, &Context) -> MaybeLazy<String>>;

/// Checks whether an object of a given type may be returned.
pub type TypeAuthorizer = Rc<dyn Fn(&Value, &Context) -> MaybeLazy<Authorization>>;

/// Checks whether a field may be resolved on an object, given its coerced arguments.
pub type FieldAuthorizer = Rc<dyn Fn(&Value, &Object, &Context) -> MaybeLazy<Authorization>>;

/// Called for every object failing authorization. `Some` replaces the object,
/// `None` hides it and `Err` reports an error instead.
pub type UnauthorizedObjectHook =
    Rc<dyn Fn(&UnauthorizedObject, &Context) -> Result<Option<Value>, FieldError>>;

/// An object which failed authorization.
#[derive(Clone, Debug)]
pub struct UnauthorizedObject {
    pub type_name: String,
    pub object: Value,
}

impl UnauthorizedObject {
    pub fn message(&self) -> String {
        format!("An object failed {}'s authorization check", self.type_name)
    }
}

/// The cost of a field during complexity analysis.
#[derive(Clone)]
pub enum Complexity {
    /// Added to the cost of the selections below the field.
    Fixed(u64),

    /// Computed from the context, the coerced arguments and the cost of the selections
    /// below the field.
    Custom(Rc<dyn Fn(&Context, &Object, u64) -> u64>),
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Fixed(1)
    }
}

impl Complexity {
    pub fn custom(f: impl Fn(&Context, &Object, u64) -> u64 + 'static) -> Self {
        Complexity::Custom(Rc::new(f))
    }

    pub fn compute(&self, context: &Context, arguments: &Object, child_complexity: u64) -> u64 {
        match self {
            Complexity::Fixed(own) => own.saturating_add(child_complexity),
            Complexity::Custom(f) => f(context, arguments, child_complexity),
        }
    }
}

impl fmt::Debug for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Fixed(own) => f.debug_tuple("Fixed").field(own).finish(),
            Complexity::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Reads `field_name` from each object, `null` for anything else.
pub(crate) fn default_resolver(info: &ResolveInfo<'_>, objects: &[Value]) -> Vec<Resolved> {
    objects
        .iter()
        .map(|object| match object {
            Value::Object(map) => Resolved::Value(map.get(info.field_name).cloned().unwrap_or_default()),
            _ => Resolved::null(),
        })
        .collect()
}
