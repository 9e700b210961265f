// Module declarations
pub mod config;
pub mod core;
pub mod network;
pub mod providers;
pub mod utils;

// Re-exports: the surface a host application works with
pub use crate::config::{ConfigOverrides, EngineConfig};
pub use crate::core::engine::{DownloadDebug, DownloadEngine, EngineOptions};
pub use crate::core::error::{EngineError, IntegrityError, TransientKind};
pub use crate::core::state::{Download, DownloadState, NewDownload, Priority};
pub use crate::providers::{
    CatalogFileInfo, CatalogProvider, FilenameCheck, SanitizingPathResolver, SavePathResolver,
};
pub use crate::utils::logger::init_logger;
pub use galleon_shared::{EngineEvent, SessionMetrics, Snapshot};
