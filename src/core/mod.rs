//! 核心层：错误与恢复、执行阶段、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{FaultKind, RecoveryAction, RelayError};
pub use recovery::{RecoveryEngine, RetryExhaustion};
pub use session_supervisor::{SessionSupervisor, TurnPermit};
pub use state::{Stage, StageTracker};
