pub mod config;
pub mod orchestrator;
pub mod providers;
pub mod sdk;
pub mod wire;

use futures::stream::BoxStream;

use crate::errors::Result;

/// Lazy, finite sequence of streamed text fragments in wire order.
pub type FragmentStream = BoxStream<'static, Result<String>>;

pub use config::{ConfigResolver, CustomProfile, InstanceConfig, ProviderConfig, ProxySettings};
pub use orchestrator::{build_adapter, HttpAdapter, ProviderAdapter};
pub use providers::{find_seed, ProviderSeed, PROVIDER_SEEDS};
pub use sdk::GeminiAdapter;
pub use wire::WireFormat;
