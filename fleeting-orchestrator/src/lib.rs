pub mod fleet;
pub mod notifications;
pub mod project;
pub mod provider_manager;
pub mod readiness;
pub mod routes;
pub mod settings;
pub mod temp_cache;

pub use fleet::{CreateRequest, FleetConfig, FleetController, FleetError};
pub use project::{Project, ProjectDirectory};
pub use temp_cache::{MemoryTempCache, RedisTempCache, TempCache};
