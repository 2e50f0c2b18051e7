//! TaskRelay - stateless task distribution for untrusted worker nodes
//!
//! TaskRelay hands out discrete tasks to a pool of remote, intermittently
//! connected nodes and reconciles the results they send back into
//! per-application storage. It sits behind a stateless request layer: data
//! the server needs back later travels inside the task as an encrypted,
//! authenticated token and is restored when the result arrives.
//!
//! # Core Concepts
//!
//! - **Nodes**: remote workers, identified by a [`NodeId`] and tracked by a [`NodesRegistry`]
//! - **Projects**: application-specific task generators and result validators ([`Project`])
//! - **Controllers**: bind a project to its storages through an ordered filter [`Pipeline`]
//! - **Session data**: `#`-prefixed task fields the node never sees in plaintext
//! - **Relay**: the facade turning requests into `{action, data}` envelopes ([`Relay`])
//!
//! # Modules
//!
//! - [`node`] - Node state, ids and the registry
//! - [`controller`] - Controllers and the application set
//! - [`pipeline`] / [`filters`] - The filter chain around controller operations
//! - [`session`] - Session data managers and the token cipher
//! - [`relay`] - The coordination facade
//! - [`sweeper`] - Background eviction of idle nodes
//! - [`config`] - Configuration types and loading

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod filters;
pub mod node;
pub mod pipeline;
pub mod project;
pub mod relay;
pub mod session;
pub mod storage;
pub mod sweeper;
pub mod task;

// Re-export commonly used types
pub use config::{Config, NodeConfig, RegistryConfig, SweeperConfig};
pub use controller::{AppState, Applications, Controller, ControllerBuilder};
pub use error::{RelayError, RelayResult};
pub use node::{MemoryNodesRegistry, Node, NodeGuard, NodeId, NodesRegistry};
pub use pipeline::{Pipeline, ResultCall, ResultFilter, ResultNext, ResultOutcome, TaskCall, TaskFilter, TaskNext};
pub use project::{Project, ProjectMode};
pub use relay::{Action, Relay, Response};
pub use session::{
    NodeSessionManager, PhonySessionManager, SessionCipher, SessionDataManager, SessionError, TokenSessionManager,
};
pub use storage::{MemoryResultsStorage, ResultsStorage};
pub use sweeper::{Sweeper, SweeperHandle};
pub use task::{ResultData, Task};
