//! 模式编排：类型、模板、状态、步骤执行、输出解析、运行器、流式包装、模式目录

pub mod executor;
pub mod outputs;
pub mod runner;
pub mod state;
pub mod store;
pub mod stream;
pub mod template;
pub mod types;

pub use executor::{PreparedStep, StepExecutor};
pub use outputs::{OutputResolver, ResolvedOutputs, ResolverWarning, WarningKind};
pub use runner::{PatternRunner, RouteRequest, RunnerOptions, DEFAULT_MAX_RECURSION_DEPTH, EXECUTION_UNAVAILABLE_KEY};
pub use state::{ExecutionState, PatternResult, PatternRun, StepOutcome, StepStatus};
pub use store::PatternStore;
pub use stream::{PatternEvent, PatternStream, StreamMode};
pub use types::*;
