//! Agent 引擎：工具调用循环、系统提示词模板与过程事件

pub mod events;
pub mod loop_;
pub mod prompt;

pub use events::ProgressEvent;
pub use loop_::{fallback_answer, run_engine, EngineFailure, EngineFinish, EngineOutcome, EngineSession};
pub use prompt::render_system_prompt;
