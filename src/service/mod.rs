//! Service layer module

pub mod enrichment;
pub mod routing;
pub mod types;

pub use enrichment::EnrichmentService;
pub use routing::{Category, EnrichmentTask};
pub use types::*;
