//! A batching GraphQL execution engine.
//!
//! Queries are parsed and statically checked ([`Query`]), analyzed ([`analysis`]) and executed
//! by a runner resolving each field once for all the objects at its position. Loads go
//! through a cooperative [`Dataloader`] which batches the keys requested by sibling fields.

#![warn(unreachable_pub)]

pub mod json_ext;

pub mod analysis;
mod configuration;
mod context;
pub mod dataloader;
pub mod error;
mod execution;
pub mod graphql;
pub mod ir;
mod query;
mod schema;
mod type_environment;

pub use configuration::Configuration;
pub use configuration::DataloaderConfig;
pub use configuration::ExecutionConfig;
pub use configuration::Limits;
pub use context::Context;
pub use dataloader::Dataloader;
pub use dataloader::Lazy;
pub use dataloader::LoadResult;
pub use dataloader::Source;
pub use dataloader::SourceHandle;
pub use error::FieldError;
pub use error::LoadError;
pub use graphql::Request;
pub use graphql::Response;
pub use query::Query;
pub use schema::Authorization;
pub use schema::Complexity;
pub use schema::MaybeLazy;
pub use schema::ResolveInfo;
pub use schema::Resolved;
pub use schema::Schema;
pub use schema::SchemaBuilder;
pub use schema::UnauthorizedObject;
pub use type_environment::TypeEnvironment;
