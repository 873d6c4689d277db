//! Configuration
//!
//! Typed schema, the three-level setting resolver, structural validation and
//! the hot-reloadable [`ConfigStore`].

pub mod resolver;
pub mod schema;
pub mod store;
pub mod validate;

pub use resolver::{
    ApiFormat, FileFormat, LayeredSource, ResolvedMode, ResolvedPolling, ResponseType, Setting,
    resolve, seconds_setting,
};
pub use schema::{
    AuthScheme, Category, ConfigDocument, EndpointConfig, EndpointStrategy, LayeredSettings,
    ModeConfig, ModelConfig, ModelSummary, NodeSettings, ParameterDescriptor, PollingConfig,
    ProviderConfig, SecretsDocument, Settings,
};
pub use store::{ConfigSnapshot, ConfigStore};
pub use validate::{ensure_valid, validate};
