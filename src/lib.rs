// foreman: multi-agent orchestration over git branches
//
// A plan of work items is executed by a pool of coding agents, each driven
// over JSON-RPC on a subprocess's stdio. Agents work on isolated branches;
// the engine serializes merges into the target branch, validates each
// merged tree, and persists resumable run state.

pub mod acp;
pub mod error;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod state;
pub mod validation;

pub use error::{ForemanError, Result};
pub use models::{Agent, AgentStatus, ExecutionPlan, WorkItem};
pub use orchestrator::{Engine, EngineConfig};
pub use state::{SessionState, StateStore};
