//! HTTP front-end for `yt-dlp`: looks up the formats of a media URL and
//! streams a downloaded file back to the client.

pub mod api;
pub mod config;
pub mod error;
pub mod formats;
pub mod server;
pub mod ytdlp;

pub use config::Config;
pub use error::{ApiError, ToolError};
pub use server::{build_router, serve};
