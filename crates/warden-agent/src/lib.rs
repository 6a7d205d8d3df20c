//! Single-host supervisor for Bedrock dedicated servers.
//!
//! [`Manager`] is the entry point: it indexes provisioned servers and uploaded saves under the
//! data root, provisions new servers through a [`TaskPipeline`] and hands out [`Server`] handles
//! for lifecycle, configuration, allow-list and log operations.

pub mod archive;
pub mod backup;
pub mod download;
pub mod error;
pub mod listing;
pub mod manager;
pub mod pipeline;
pub mod properties;
pub mod saves;
pub mod server;
pub mod settings;

pub use error::{Error, ErrorKind, ErrorPayload, Result};
pub use listing::{Page, PageQuery, SortOrder};
pub use manager::{CreateServer, Manager, ServerInfo, ServerUpdate};
pub use pipeline::{PipelineState, Task, TaskPipeline, TaskStatus};
pub use properties::ServerProperties;
pub use saves::SaveInfo;
pub use server::{AllowListEntry, Server, ServerMeta};
pub use settings::AgentSettings;
