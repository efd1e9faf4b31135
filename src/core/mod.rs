//! 核心层：错误分类与运行时构建

pub mod builder;
pub mod error;

pub use builder::{build_store, create_runtime_builder, RuntimeBuilder};
pub use error::{AgentError, ErrorClass};
