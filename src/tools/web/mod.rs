//! Web search providers

mod search;

pub use search::{SearchProvider, SearchResult, WebSearchTool};
