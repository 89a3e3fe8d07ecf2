//! Ephemeral static preview servers for generated projects.
//!
//! [`PreviewManager`] materializes an in-memory file map under a private
//! directory, serves it on a freshly allocated port and reclaims the port,
//! listener and files when the preview is stopped or evicted.

pub mod config;
pub mod error;
pub mod http_server;
pub mod manager;
pub mod ports;
pub mod shutdown;
pub mod site;
pub mod state;
pub mod workspace;

pub use config::ManagerConfig;
pub use error::{PreviewError, Result};
pub use manager::PreviewManager;
pub use state::{ActivePreview, CreatedPreview, PreviewDetails};
pub use workspace::{FileMap, VirtualFile};
