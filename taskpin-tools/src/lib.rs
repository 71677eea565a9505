//! # Taskpin Tools
//!
//! The tools the agent may call: a declarative argument schema, the
//! registry that validates and executes calls, and the task-list tools.

pub mod dates;
pub mod registry;
pub mod schema;
pub mod tasks;

pub use registry::{Tool, ToolRegistry};
pub use schema::{ArgumentSchema, Arguments, FieldSpec, Rule, Validator};
pub use tasks::{TaskToolContext, register_task_tools, task_registry};
