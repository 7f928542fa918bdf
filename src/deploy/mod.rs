pub mod engine;
pub mod hasher;
pub mod policy;

pub use engine::{deploy_stack, run_auto_devops_pass, sanitize_project, DeployEvent, DeployOptions};
pub use policy::should_auto_apply;
