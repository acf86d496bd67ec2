//! Core library of the novel generation helper.
//!
//! - [`agents`] resolves provider configuration and talks to the model backends.
//! - [`prompts`] turns novel data into chapter and outline prompts.
//! - [`model_manager`] ties an active provider to prompt assembly and storage.
//! - [`store`] keeps the in-memory novel behind a small cache and writes JSON snapshots.
//! - [`novel`] defines the novel data model.
//! - [`errors`] keeps the central error catalogue with human friendly metadata.
//! - [`logging`] emits structured diagnostics through the `log` facade.
//! - [`workers`] runs synchronous provider clients on the blocking pool.

pub mod agents;
pub mod errors;
pub mod logging;
pub mod model_manager;
pub mod novel;
pub mod prompts;
pub mod store;
pub mod workers;

pub use agents::{ConfigResolver, FragmentStream, InstanceConfig, ProviderAdapter, ProviderConfig};
pub use errors::{NovelGenError, Result};
pub use model_manager::{FragmentObserver, ModelManager};
pub use novel::{ChapterOutline, Character, NovelData, Outline, Volume};
pub use prompts::outline::{OutlineRange, OutlineRequest};
pub use prompts::PromptAssembler;
pub use store::NovelDataStore;
