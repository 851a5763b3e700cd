pub mod catalog;
pub mod command;
pub mod executor;
pub mod registry;
pub mod schema;

pub use catalog::{load_catalog, register_catalog, CatalogEntry};
pub use command::CommandTool;
pub use executor::ExecutionEngine;
pub use registry::{Tool, ToolRegistry};
pub use schema::{descriptor_schema_json, CostClass, ParamSpec, ParamType, ToolDescriptor};
