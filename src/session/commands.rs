//! Locally handled commands
//!
//! Shutdown phrases and a few fixed questions are answered without asking
//! the remote model. Tables load from `commands.toml` and fall back to the
//! built-in defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Replies for identity questions matched anywhere in the text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRule {
    /// Substrings that trigger the reply
    pub patterns: Vec<String>,
    /// Reply text, may use `{{variable}}` placeholders
    pub reply: String,
}

/// Replies for greetings matched against the whole text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingRule {
    /// Exact phrases that trigger the reply
    pub phrases: Vec<String>,
    /// Reply text, may use `{{variable}}` placeholders
    pub reply: String,
}

/// Tables driving [`LocalCommandInterceptor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTables {
    /// Identity and owner questions
    pub identity: Vec<IdentityRule>,
    /// Substrings that put the session to sleep
    pub shutdown_phrases: Vec<String>,
    /// Spoken before sleeping; silent when unset
    pub shutdown_acknowledgement: Option<String>,
    /// Greetings and thanks
    pub greetings: Vec<GreetingRule>,
    /// Values substituted into replies
    pub variables: HashMap<String, String>,
}

impl Default for CommandTables {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(ToString::to_string).collect();

        Self {
            identity: vec![
                IdentityRule {
                    patterns: strings(&[
                        "who made you",
                        "who created you",
                        "who built you",
                        "who owns you",
                        "who is your owner",
                        "who's your owner",
                    ]),
                    reply: "I was built by {{owner}}.".to_string(),
                },
                IdentityRule {
                    patterns: strings(&["what is your name", "what's your name", "who are you"]),
                    reply: "I'm {{name}}, your voice assistant.".to_string(),
                },
            ],
            shutdown_phrases: strings(&[
                "shutdown",
                "shut down",
                "go to sleep",
                "goodbye",
                "stop listening",
            ]),
            shutdown_acknowledgement: None,
            greetings: vec![
                GreetingRule {
                    phrases: strings(&["hello", "hi", "hey", "hello there", "hi there", "hey there"]),
                    reply: "Hello! How can I help?".to_string(),
                },
                GreetingRule {
                    phrases: strings(&["thanks", "thank you", "thanks a lot", "thank you so much"]),
                    reply: "You're welcome!".to_string(),
                },
                GreetingRule {
                    phrases: strings(&["good morning"]),
                    reply: "Good morning! What can I do for you?".to_string(),
                },
            ],
            variables: HashMap::from([
                ("name".to_string(), "Vesper".to_string()),
                ("owner".to_string(), "the Vesper developers".to_string()),
            ]),
        }
    }
}

impl CommandTables {
    /// Load tables from a TOML file
    ///
    /// Sections missing from the file keep their defaults. Variables are
    /// merged over the default variables.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut tables: Self = toml::from_str(&content)?;

        let mut variables = Self::default().variables;
        variables.extend(tables.variables);
        tables.variables = variables;

        tracing::debug!(path = %path.display(), "loaded command tables");
        Ok(tables)
    }

    /// Load tables, falling back to defaults if the file is missing or bad
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "invalid command tables, using defaults");
            Self::default()
        })
    }
}

/// What to do with a piece of user text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Not a local command; forward it
    Unhandled,
    /// Answer locally with this text
    Reply(String),
    /// Enter standby, optionally speaking first
    Shutdown {
        /// Text to speak before sleeping
        acknowledgement: Option<String>,
    },
}

/// Normalize text for matching
///
/// Lowercases, folds typographic apostrophes, collapses whitespace and
/// strips trailing punctuation.
#[must_use]
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '\u{2019}' | '\u{2018}' | '\u{02BC}' => '\'',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .collect();

    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| {
            matches!(c, '.' | '!' | '?' | ',' | ';' | ':' | '\u{2026}') || c.is_whitespace()
        })
        .to_string()
}

/// Replace `{{name}}` placeholders with values from `variables`
fn render(template: &str, variables: &HashMap<String, String>) -> String {
    variables.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{{{key}}}}}"), value)
    })
}

/// Matches user text against the command tables
#[derive(Debug, Clone)]
pub struct LocalCommandInterceptor {
    identity: Vec<(Vec<String>, String)>,
    shutdown_phrases: Vec<String>,
    acknowledgement: Option<String>,
    greetings: Vec<(Vec<String>, String)>,
}

impl Default for LocalCommandInterceptor {
    fn default() -> Self {
        Self::new(CommandTables::default())
    }
}

impl LocalCommandInterceptor {
    /// Build an interceptor, normalizing every phrase and rendering replies
    #[must_use]
    pub fn new(tables: CommandTables) -> Self {
        let phrases = |items: Vec<String>| -> Vec<String> {
            items
                .iter()
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty())
                .collect()
        };
        let variables = tables.variables;

        Self {
            identity: tables
                .identity
                .into_iter()
                .map(|rule| (phrases(rule.patterns), render(&rule.reply, &variables)))
                .collect(),
            shutdown_phrases: phrases(tables.shutdown_phrases),
            acknowledgement: tables
                .shutdown_acknowledgement
                .map(|a| render(&a, &variables))
                .filter(|a| !a.trim().is_empty()),
            greetings: tables
                .greetings
                .into_iter()
                .map(|rule| (phrases(rule.phrases), render(&rule.reply, &variables)))
                .collect(),
        }
    }

    /// Classify `text`
    ///
    /// Identity questions win over shutdown phrases, which win over
    /// greetings.
    #[must_use]
    pub fn intercept(&self, text: &str) -> Interception {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Interception::Unhandled;
        }

        for (patterns, reply) in &self.identity {
            if patterns.iter().any(|p| normalized.contains(p.as_str())) {
                tracing::debug!(text = %normalized, "identity question answered locally");
                return Interception::Reply(reply.clone());
            }
        }

        if self
            .shutdown_phrases
            .iter()
            .any(|p| normalized.contains(p.as_str()))
        {
            tracing::debug!(text = %normalized, "shutdown phrase detected");
            return Interception::Shutdown {
                acknowledgement: self.acknowledgement.clone(),
            };
        }

        for (phrases, reply) in &self.greetings {
            if phrases.contains(&normalized) {
                return Interception::Reply(reply.clone());
            }
        }

        Interception::Unhandled
    }

    /// Text spoken before entering standby, if configured
    #[must_use]
    pub fn acknowledgement(&self) -> Option<&str> {
        self.acknowledgement.as_deref()
    }

    /// Whether `text` is a shutdown command
    #[must_use]
    pub fn is_shutdown(&self, text: &str) -> bool {
        matches!(self.intercept(text), Interception::Shutdown { .. })
    }
}
