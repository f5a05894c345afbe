//! Tools the remote model can call
//!
//! Calls arrive as a name plus raw JSON arguments and are parsed into a
//! [`ToolRequest`] before anything runs.

mod dispatcher;
mod toolbox;
mod web;

use serde::Deserialize;
use serde_json::json;

pub use dispatcher::{Completion, Dispatch, ToolDispatcher, ToolMessage, ToolOutcome};
pub use toolbox::Toolbox;
pub use web::{SearchProvider, SearchResult, WebSearchTool};

use crate::{Error, Result};

/// Tool name for web search
pub const SEARCH_WEB: &str = "searchWeb";

/// Tool name for nearby place search
pub const FIND_NEARBY_PLACES: &str = "findNearbyPlaces";

/// Tool name for image generation
pub const GENERATE_IMAGE: &str = "generateImage";

/// Tool name for entering standby
pub const SHUTDOWN: &str = "shutdown";

/// Aspect ratio used when the model does not ask for one
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";

const ASPECT_RATIOS: &[&str] = &["1:1", "3:4", "4:3", "9:16", "16:9"];

/// A parsed tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    /// Search the web
    SearchWeb {
        /// Search query
        query: String,
    },
    /// Search for places
    FindNearbyPlaces {
        /// What to look for
        query: String,
        /// Where to look, if given
        location: Option<String>,
    },
    /// Generate an image
    GenerateImage {
        /// Image description
        prompt: String,
        /// One of the supported aspect ratios
        aspect_ratio: String,
    },
    /// Put the session to sleep
    Shutdown,
    /// Anything else
    Unknown {
        /// Name the model used
        name: String,
    },
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageArgs {
    prompt: String,
    #[serde(default)]
    aspect_ratio: Option<String>,
}

fn args<T: serde::de::DeserializeOwned>(name: &str, arguments: &serde_json::Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments)
        .map_err(|e| Error::Tool(format!("invalid arguments for {name}: {e}")))
}

fn required(name: &str, field: &str, value: String) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Tool(format!("{name} requires a non-empty {field}")));
    }
    Ok(trimmed.to_string())
}

impl ToolRequest {
    /// Parse a call by name and JSON arguments
    ///
    /// Unknown names parse successfully as [`ToolRequest::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns error if a known tool has missing or invalid arguments
    pub fn parse(name: &str, arguments: &serde_json::Value) -> Result<Self> {
        match name {
            SEARCH_WEB => {
                let QueryArgs { query, .. } = args(name, arguments)?;
                Ok(Self::SearchWeb {
                    query: required(name, "query", query)?,
                })
            }
            FIND_NEARBY_PLACES => {
                let QueryArgs { query, location } = args(name, arguments)?;
                Ok(Self::FindNearbyPlaces {
                    query: required(name, "query", query)?,
                    location: location
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty()),
                })
            }
            GENERATE_IMAGE => {
                let ImageArgs {
                    prompt,
                    aspect_ratio,
                } = args(name, arguments)?;
                let aspect_ratio = aspect_ratio.unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string());
                if !ASPECT_RATIOS.contains(&aspect_ratio.as_str()) {
                    return Err(Error::Tool(format!(
                        "unsupported aspect ratio {aspect_ratio}, expected one of {}",
                        ASPECT_RATIOS.join(", ")
                    )));
                }
                Ok(Self::GenerateImage {
                    prompt: required(name, "prompt", prompt)?,
                    aspect_ratio,
                })
            }
            SHUTDOWN => Ok(Self::Shutdown),
            other => Ok(Self::Unknown {
                name: other.to_string(),
            }),
        }
    }
}

/// Function declarations offered to the realtime model
#[must_use]
pub fn function_declarations() -> Vec<serde_json::Value> {
    vec![
        json!({
            "name": SEARCH_WEB,
            "description": "Search the web for current information and answer with sources.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "query": { "type": "STRING", "description": "What to search for" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": FIND_NEARBY_PLACES,
            "description": "Find places such as restaurants, shops or landmarks.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "query": { "type": "STRING", "description": "Kind of place to find" },
                    "location": { "type": "STRING", "description": "Area to search in" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": GENERATE_IMAGE,
            "description": "Generate an image from a description and show it to the user.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "prompt": { "type": "STRING", "description": "Description of the image" },
                    "aspectRatio": { "type": "STRING", "enum": ASPECT_RATIOS }
                },
                "required": ["prompt"]
            }
        }),
        json!({
            "name": SHUTDOWN,
            "description": "Stop the conversation and go to sleep until the wake word is heard.",
            "parameters": { "type": "OBJECT", "properties": {} }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tools() {
        assert_eq!(
            ToolRequest::parse(SEARCH_WEB, &json!({"query": " rust news "})).unwrap(),
            ToolRequest::SearchWeb {
                query: "rust news".to_string()
            }
        );
        assert_eq!(
            ToolRequest::parse(FIND_NEARBY_PLACES, &json!({"query": "coffee", "location": ""}))
                .unwrap(),
            ToolRequest::FindNearbyPlaces {
                query: "coffee".to_string(),
                location: None
            }
        );
        assert_eq!(
            ToolRequest::parse(GENERATE_IMAGE, &json!({"prompt": "a fox"})).unwrap(),
            ToolRequest::GenerateImage {
                prompt: "a fox".to_string(),
                aspect_ratio: "1:1".to_string()
            }
        );
        assert_eq!(
            ToolRequest::parse(SHUTDOWN, &serde_json::Value::Null).unwrap(),
            ToolRequest::Shutdown
        );
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(ToolRequest::parse(SEARCH_WEB, &json!({})).is_err());
        assert!(ToolRequest::parse(SEARCH_WEB, &json!({"query": "   "})).is_err());
        assert!(ToolRequest::parse(SEARCH_WEB, &json!({"query": 7})).is_err());
        assert!(
            ToolRequest::parse(GENERATE_IMAGE, &json!({"prompt": "x", "aspectRatio": "2:1"}))
                .is_err()
        );
    }

    #[test]
    fn test_unknown_tool_parses_as_unknown() {
        assert_eq!(
            ToolRequest::parse("launchRockets", &json!({})).unwrap(),
            ToolRequest::Unknown {
                name: "launchRockets".to_string()
            }
        );
    }

    #[test]
    fn test_declarations_cover_every_tool() {
        let names: Vec<String> = function_declarations()
            .iter()
            .map(|d| d["name"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, [SEARCH_WEB, FIND_NEARBY_PLACES, GENERATE_IMAGE, SHUTDOWN]);
    }
}
