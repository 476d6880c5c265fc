//! Tool-orchestration runtime for conversational agents.
//!
//! # Architecture
//!
//! - **mirror**: parallel package-registry speed test with a cached winner
//! - **provider_registry**: starts and stops one session client per tool provider
//! - **catalog**: flattens provider tool listings into one conflict-free namespace
//! - **processor**: runs a batch of tool calls and folds results into the conversation
//! - **engine**: the agent loop that streams model output and drives tool rounds
//! - **orchestrator**: the facade that owns and wires all of the above
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchyard_core::RuntimeConfig;
//! use switchyard_orchestrator::{Orchestrator, TurnRequest};
//! use switchyard_tool_runtime::{ConversationMessage, ModelAdapter};
//!
//! # async fn example(adapter: Arc<dyn ModelAdapter>) -> Result<(), switchyard_orchestrator::OrchestratorError> {
//! let orchestrator = Orchestrator::new(RuntimeConfig::default());
//! orchestrator.register_adapter("claude", adapter);
//! orchestrator.start_providers().await;
//!
//! let mut events = orchestrator.start_turn(TurnRequest::new(
//!     "claude",
//!     "claude-sonnet",
//!     "turn-1",
//!     vec![ConversationMessage::User("List my files".to_string())],
//! ))?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod events;
pub mod mirror;
pub mod orchestrator;
pub mod processor;
pub mod provider_registry;

pub use catalog::{CanonicalTool, CatalogSnapshot, ListingFailure, ToolCatalog};
pub use deferred::Deferred;
pub use engine::{ActiveTurn, AgentLoopEngine, TurnRequest};
pub use error::OrchestratorError;
pub use events::{EventSink, ToolMode, TurnEvent};
pub use mirror::{HttpProber, MirrorChoice, MirrorSelector, ProbeResult, Prober};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RUNTIME_BUILTIN};
pub use processor::{BatchContext, BatchOutcome, ToolCallProcessor, ToolOutcome};
pub use provider_registry::{
    ConfigConnectorFactory, ConnectorFactory, ProviderRegistry, ProviderStatus,
};
