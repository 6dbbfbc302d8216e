//! Built-in tools.

mod file_read;
mod http_get;

pub use file_read::FileReadTool;
pub use http_get::HttpGetTool;
