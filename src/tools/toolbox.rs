//! Tool backend routing

use std::sync::Arc;

use async_trait::async_trait;

use super::WebSearchTool;
use crate::Result;
use crate::assistant::{GeneratedImage, SourcedAnswer, ToolBackend};

/// Results requested from a dedicated search provider
const WEB_RESULT_LIMIT: usize = 5;

/// Routes web search to a dedicated provider when one is configured and
/// everything else to the model backend
pub struct Toolbox {
    model: Arc<dyn ToolBackend>,
    web: Option<WebSearchTool>,
}

impl Toolbox {
    /// Create a toolbox over a model backend
    #[must_use]
    pub fn new(model: Arc<dyn ToolBackend>) -> Self {
        Self { model, web: None }
    }

    /// Use `web` for `searchWeb` instead of model grounding
    #[must_use]
    pub fn with_web_search(mut self, web: WebSearchTool) -> Self {
        self.web = Some(web);
        self
    }
}

#[async_trait]
impl ToolBackend for Toolbox {
    async fn search_web(&self, query: &str) -> Result<SourcedAnswer> {
        match &self.web {
            Some(web) => web.answer(query, WEB_RESULT_LIMIT).await,
            None => self.model.search_web(query).await,
        }
    }

    async fn search_places(&self, query: &str, location: Option<&str>) -> Result<SourcedAnswer> {
        self.model.search_places(query, location).await
    }

    async fn generate_image(&self, prompt: &str, aspect_ratio: &str) -> Result<GeneratedImage> {
        self.model.generate_image(prompt, aspect_ratio).await
    }
}
