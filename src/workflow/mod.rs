//! Workflow engine: multi-step browser automation.

pub mod allowed;
pub mod manager;
pub mod runner;
pub mod schema;
pub mod steps;
pub mod template;
pub mod value;

pub use manager::WorkflowManager;
pub use runner::WorkflowRunner;
pub use schema::*;
pub use steps::StepExecutor;
