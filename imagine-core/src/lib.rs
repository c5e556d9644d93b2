//! Model catalog, load-state registry and request validation shared by the
//! imagine server and client.

pub mod api;
pub mod catalog;
pub mod error;
pub mod model;
pub mod registry;
pub mod validator;

pub use catalog::{CatalogEntry, ModelCatalog, ModelConfig};
pub use error::{CatalogError, ServeError, ValidationError};
pub use model::{GenerationParams, ImageModel, ModelFactory, ModelHandle, ModelInfo};
pub use registry::{ModelRegistry, ModelStatus, StatusSnapshot};
pub use validator::{GenerationRequest, ParamValue};
