//! Tool call dispatch and correlation
//!
//! Every call runs as its own task and reports back through an outcome
//! channel. The dispatcher tracks outstanding ids so duplicates are refused
//! and completions from a cancelled generation are ignored.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ToolRequest;
use crate::assistant::{GeneratedImage, Source, ToolBackend};
use crate::realtime::{PendingToolCall, ToolResult};

/// What the user sees for a finished tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolMessage {
    /// Answer with sources, shown as an agent message
    Answer {
        /// Answer text
        text: String,
        /// Supporting sources
        sources: Vec<Source>,
    },
    /// Generated image, shown as an agent message
    Image {
        /// Caption
        text: String,
        /// The image
        image: GeneratedImage,
    },
    /// Failure, shown as a system message
    Failure {
        /// "I failed to ..." text
        text: String,
    },
}

/// A finished call: the message to show, then the result to send
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// User-visible message
    pub message: ToolMessage,
    /// Response for the remote model
    pub result: ToolResult,
}

impl Completion {
    fn failure(id: String, name: String, action: &str, error: &str) -> Self {
        Self {
            message: ToolMessage::Failure {
                text: format!("I failed to {action}: {error}"),
            },
            result: ToolResult {
                id,
                name,
                payload: json!({ "error": error }),
            },
        }
    }
}

/// Report from a tool task
#[derive(Debug)]
pub struct ToolOutcome {
    generation: u64,
    id: String,
    completion: Completion,
}

/// Immediate result of [`ToolDispatcher::dispatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A task was started; its outcome arrives later
    Spawned,
    /// Answered without running anything (unknown tool, bad arguments)
    Immediate(Completion),
    /// The model asked to shut down; send this result, then enter standby
    Shutdown(ToolResult),
    /// The id is already outstanding; nothing was started and no result
    /// is owed beyond the running call's
    Duplicate {
        /// Tool the repeated call asked for
        name: String,
    },
}

/// Runs tool calls against a [`ToolBackend`]
pub struct ToolDispatcher {
    backend: Arc<dyn ToolBackend>,
    outstanding: HashMap<String, JoinHandle<()>>,
    generation: u64,
}

impl ToolDispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend,
            outstanding: HashMap::new(),
            generation: 0,
        }
    }

    /// Start handling a call
    ///
    /// Spawned tasks report to `outcomes`; feed what arrives there to
    /// [`complete`](Self::complete).
    pub fn dispatch(
        &mut self,
        call: PendingToolCall,
        outcomes: &mpsc::UnboundedSender<ToolOutcome>,
    ) -> Dispatch {
        let PendingToolCall {
            id,
            name,
            arguments,
        } = call;

        if self.outstanding.contains_key(&id) {
            tracing::warn!(id = %id, name = %name, "duplicate tool call id ignored");
            return Dispatch::Duplicate { name };
        }

        let request = match ToolRequest::parse(&name, &arguments) {
            Ok(ToolRequest::Unknown { name: unknown }) => {
                tracing::warn!(id = %id, name = %unknown, "unknown tool requested");
                let action = format!("run {unknown}");
                return Dispatch::Immediate(Completion::failure(id, name, &action, "unknown tool"));
            }
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(id = %id, name = %name, error = %e, "invalid tool call");
                let action = format!("run {name}");
                return Dispatch::Immediate(Completion::failure(
                    id,
                    name,
                    &action,
                    &e.to_string(),
                ));
            }
        };

        if request == ToolRequest::Shutdown {
            tracing::info!(id = %id, "model requested shutdown");
            return Dispatch::Shutdown(ToolResult {
                id,
                name,
                payload: json!({ "status": "ok" }),
            });
        }

        tracing::info!(id = %id, name = %name, "dispatching tool call");

        let backend = Arc::clone(&self.backend);
        let outcomes = outcomes.clone();
        let generation = self.generation;
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            let completion =
                AssertUnwindSafe(run(backend.as_ref(), task_id.clone(), name.clone(), request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(id = %task_id, name = %name, "tool handler panicked");
                        Completion::failure(
                            task_id.clone(),
                            name.clone(),
                            &format!("run {name}"),
                            "handler panicked",
                        )
                    });
            let _ = outcomes.send(ToolOutcome {
                generation,
                id: task_id,
                completion,
            });
        });
        self.outstanding.insert(id, handle);

        Dispatch::Spawned
    }

    /// Accept a task outcome
    ///
    /// Returns `None` for outcomes from a cancelled generation or for ids
    /// that are no longer outstanding.
    pub fn complete(&mut self, outcome: ToolOutcome) -> Option<Completion> {
        if outcome.generation != self.generation {
            tracing::debug!(id = %outcome.id, "stale tool outcome ignored");
            return None;
        }
        self.outstanding.remove(&outcome.id)?;
        Some(outcome.completion)
    }

    /// Abort every outstanding task
    ///
    /// Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.outstanding.len();
        for (_, handle) in self.outstanding.drain() {
            handle.abort();
        }
        self.generation += 1;

        if cancelled > 0 {
            tracing::debug!(cancelled, "tool calls cancelled");
        }
        cancelled
    }

    /// Number of calls still running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }
}

async fn run(backend: &dyn ToolBackend, id: String, name: String, request: ToolRequest) -> Completion {
    match request {
        ToolRequest::SearchWeb { query } => match backend.search_web(&query).await {
            Ok(answer) => answer_completion(id, name, answer.text, answer.sources),
            Err(e) => Completion::failure(id, name, "search the web", &e.to_string()),
        },
        ToolRequest::FindNearbyPlaces { query, location } => {
            match backend.search_places(&query, location.as_deref()).await {
                Ok(answer) => answer_completion(id, name, answer.text, answer.sources),
                Err(e) => Completion::failure(id, name, "find nearby places", &e.to_string()),
            }
        }
        ToolRequest::GenerateImage {
            prompt,
            aspect_ratio,
        } => match backend.generate_image(&prompt, &aspect_ratio).await {
            Ok(image) => Completion {
                result: ToolResult {
                    id,
                    name,
                    payload: json!({
                        "status": "generated",
                        "mimeType": image.mime_type,
                        "note": "The image is now shown to the user.",
                    }),
                },
                message: ToolMessage::Image {
                    text: format!("Here is an image of {prompt}."),
                    image,
                },
            },
            Err(e) => Completion::failure(id, name, "generate an image", &e.to_string()),
        },
        ToolRequest::Shutdown | ToolRequest::Unknown { .. } => {
            Completion::failure(id, name, "run this tool", "not handled here")
        }
    }
}

fn answer_completion(id: String, name: String, text: String, sources: Vec<Source>) -> Completion {
    Completion {
        result: ToolResult {
            id,
            name,
            payload: json!({ "answer": text, "sources": sources }),
        },
        message: ToolMessage::Answer { text, sources },
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::assistant::SourcedAnswer;
    use crate::{Error, Result};

    /// Backend that blocks web searches until released
    #[derive(Default)]
    struct GateBackend {
        release: Notify,
    }

    #[async_trait]
    impl ToolBackend for GateBackend {
        async fn search_web(&self, query: &str) -> Result<SourcedAnswer> {
            self.release.notified().await;
            Ok(SourcedAnswer {
                text: format!("results for {query}"),
                sources: vec![Source {
                    uri: "https://example.com".to_string(),
                    title: "Example".to_string(),
                }],
            })
        }

        async fn search_places(&self, _query: &str, _location: Option<&str>) -> Result<SourcedAnswer> {
            Err(Error::Tool("maps unavailable".to_string()))
        }

        async fn generate_image(&self, _prompt: &str, _aspect_ratio: &str) -> Result<GeneratedImage> {
            Ok(GeneratedImage {
                uri: "data:image/png;base64,AAAA".to_string(),
                mime_type: "image/png".to_string(),
            })
        }
    }

    /// Backend whose web search panics
    struct PanickingBackend;

    #[async_trait]
    impl ToolBackend for PanickingBackend {
        async fn search_web(&self, _query: &str) -> Result<SourcedAnswer> {
            panic!("search index corrupted");
        }

        async fn search_places(&self, _query: &str, _location: Option<&str>) -> Result<SourcedAnswer> {
            Err(Error::Tool("maps unavailable".to_string()))
        }

        async fn generate_image(&self, _prompt: &str, _aspect_ratio: &str) -> Result<GeneratedImage> {
            Err(Error::Tool("images unavailable".to_string()))
        }
    }

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> PendingToolCall {
        PendingToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_search_completes_with_sources() {
        let backend = Arc::new(GateBackend::default());
        let mut dispatcher = ToolDispatcher::new(Arc::clone(&backend) as Arc<dyn ToolBackend>);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let dispatched = dispatcher.dispatch(call("1", "searchWeb", json!({"query": "rust"})), &tx);
        assert_eq!(dispatched, Dispatch::Spawned);
        assert_eq!(dispatcher.in_flight(), 1);

        backend.release.notify_one();
        let completion = dispatcher.complete(rx.recv().await.unwrap()).unwrap();

        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(completion.result.id, "1");
        assert_eq!(completion.result.payload["answer"], "results for rust");
        assert!(matches!(completion.message, ToolMessage::Answer { ref sources, .. } if sources.len() == 1));
    }

    #[tokio::test]
    async fn test_failure_becomes_error_payload_and_message() {
        let mut dispatcher = ToolDispatcher::new(Arc::new(GateBackend::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.dispatch(call("2", "findNearbyPlaces", json!({"query": "tea"})), &tx);
        let completion = dispatcher.complete(rx.recv().await.unwrap()).unwrap();

        assert_eq!(completion.result.payload["error"], "tool error: maps unavailable");
        assert_eq!(
            completion.message,
            ToolMessage::Failure {
                text: "I failed to find nearby places: tool error: maps unavailable".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_calls_answer_immediately() {
        let mut dispatcher = ToolDispatcher::new(Arc::new(GateBackend::default()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let Dispatch::Immediate(unknown) = dispatcher.dispatch(call("3", "teleport", json!({})), &tx)
        else {
            panic!("expected immediate completion");
        };
        assert_eq!(unknown.result.payload["error"], "unknown tool");

        let Dispatch::Immediate(invalid) = dispatcher.dispatch(call("4", "searchWeb", json!({})), &tx)
        else {
            panic!("expected immediate completion");
        };
        assert_eq!(invalid.result.id, "4");
        assert!(matches!(invalid.message, ToolMessage::Failure { .. }));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_handled_inline() {
        let mut dispatcher = ToolDispatcher::new(Arc::new(GateBackend::default()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let Dispatch::Shutdown(result) = dispatcher.dispatch(call("5", "shutdown", json!({})), &tx)
        else {
            panic!("expected shutdown");
        };
        assert_eq!(result.name, "shutdown");
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_outstanding_id_is_refused() {
        let mut dispatcher = ToolDispatcher::new(Arc::new(GateBackend::default()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = dispatcher.dispatch(call("6", "searchWeb", json!({"query": "a"})), &tx);
        let second = dispatcher.dispatch(call("6", "searchWeb", json!({"query": "b"})), &tx);

        assert_eq!(first, Dispatch::Spawned);
        assert_eq!(
            second,
            Dispatch::Duplicate {
                name: "searchWeb".to_string()
            }
        );
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_still_reports_its_result() {
        let mut dispatcher = ToolDispatcher::new(Arc::new(PanickingBackend));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let dispatched = dispatcher.dispatch(call("42", "searchWeb", json!({"query": "rust"})), &tx);
        assert_eq!(dispatched, Dispatch::Spawned);

        let completion = dispatcher.complete(rx.recv().await.unwrap()).unwrap();
        assert_eq!(completion.result.id, "42");
        assert_eq!(completion.result.payload["error"], "handler panicked");
        assert_eq!(
            completion.message,
            ToolMessage::Failure {
                text: "I failed to run searchWeb: handler panicked".to_string()
            }
        );
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_outcomes_are_ignored() {
        let backend = Arc::new(GateBackend::default());
        let mut dispatcher = ToolDispatcher::new(Arc::clone(&backend) as Arc<dyn ToolBackend>);
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.dispatch(call("7", "generateImage", json!({"prompt": "a fox"})), &tx);
        let outcome = rx.recv().await.unwrap();

        assert_eq!(dispatcher.cancel_all(), 1);
        assert!(dispatcher.complete(outcome).is_none());
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
