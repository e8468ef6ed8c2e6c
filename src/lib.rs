pub mod catalog;
pub mod config;
pub mod error;
pub mod loader;
pub mod pipeline;

pub use catalog::ModelCatalog;
pub use config::{CatalogConfig, PluginLoaderConfig};
pub use error::{CoreError, CoreResult};
pub use loader::{PluginDescriptor, PluginLoader};
pub use pipeline::{Pipeline, Plugin};
