//! Post-response operations attached to flows.
//!
//! Operations run in declared order against the just-received response.
//! Side-effect operations contribute [`Verdict::Continue`]; control-flow
//! operations produce a terminal verdict that short-circuits the rest of the
//! list. `Http` and `Grep` wrap nested operation lists and recurse.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::http::ResponseSnapshot;
use crate::plugins::{Part, Plugin};
use crate::session::PluginStore;

/// What a `Save` operation writes.
#[derive(Debug, Clone)]
pub enum SaveSource {
    Plugin(Plugin),
    Body,
}

/// Post-response action. `Http`/`Grep` embed further operations.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Terminal: go to the named stage, or stop normally when `None`.
    NextStage(Option<String>),
    /// Prints each item on its own line; plugins print as `name = value`.
    Print(Vec<Part>),
    PrintBody,
    /// Prints the named response headers, or all of them when `None`.
    PrintHeaders(Option<Vec<String>>),
    /// Prints the named response cookies, or all of them when `None`.
    PrintCookies(Option<Vec<String>>),
    Save {
        path: PathBuf,
        source: SaveSource,
        append: bool,
    },
    /// Terminal: abort the run with a message.
    Error(String),
    /// Runs `action` when the response status matches, `otherwise` if not.
    Http {
        status: u16,
        action: Vec<Operation>,
        otherwise: Vec<Operation>,
    },
    /// Runs `action` when the body matches the regex, `otherwise` if not.
    Grep {
        pattern: Regex,
        action: Vec<Operation>,
        otherwise: Vec<Operation>,
    },
}

impl Operation {
    pub fn next_stage(name: impl Into<String>) -> Self {
        Operation::NextStage(Some(name.into()))
    }

    /// `NextStage(None)`: end the authentication normally.
    pub fn stop() -> Self {
        Operation::NextStage(None)
    }

    pub fn print(items: Vec<Part>) -> Self {
        Operation::Print(items)
    }

    pub fn print_body() -> Self {
        Operation::PrintBody
    }

    pub fn print_headers() -> Self {
        Operation::PrintHeaders(None)
    }

    pub fn print_headers_named(names: Vec<String>) -> Self {
        Operation::PrintHeaders(Some(names))
    }

    pub fn print_cookies() -> Self {
        Operation::PrintCookies(None)
    }

    pub fn print_cookies_named(names: Vec<String>) -> Self {
        Operation::PrintCookies(Some(names))
    }

    pub fn save(path: impl Into<PathBuf>, plugin: Plugin) -> Self {
        Operation::Save {
            path: path.into(),
            source: SaveSource::Plugin(plugin),
            append: false,
        }
    }

    pub fn save_append(path: impl Into<PathBuf>, plugin: Plugin) -> Self {
        Operation::Save {
            path: path.into(),
            source: SaveSource::Plugin(plugin),
            append: true,
        }
    }

    pub fn save_body(path: impl Into<PathBuf>, append: bool) -> Self {
        Operation::Save {
            path: path.into(),
            source: SaveSource::Body,
            append,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Operation::Error(message.into())
    }

    pub fn http(status: u16, action: Vec<Operation>) -> Self {
        Operation::Http {
            status,
            action,
            otherwise: Vec::new(),
        }
    }

    pub fn http_else(status: u16, action: Vec<Operation>, otherwise: Vec<Operation>) -> Self {
        Operation::Http {
            status,
            action,
            otherwise,
        }
    }

    pub fn grep(pattern: &str, action: Vec<Operation>) -> Result<Self> {
        Ok(Operation::Grep {
            pattern: Regex::new(pattern)?,
            action,
            otherwise: Vec::new(),
        })
    }

    pub fn grep_else(
        pattern: &str,
        action: Vec<Operation>,
        otherwise: Vec<Operation>,
    ) -> Result<Self> {
        Ok(Operation::Grep {
            pattern: Regex::new(pattern)?,
            action,
            otherwise,
        })
    }
}

/// Result of evaluating a flow's operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Next(String),
    Stop,
    Error(String),
}

impl Verdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Continue)
    }
}

/// Evaluates operations in order; the first terminal verdict wins.
pub(crate) fn evaluate(
    operations: &[Operation],
    response: &ResponseSnapshot,
    store: &PluginStore,
) -> Result<Verdict> {
    for operation in operations {
        let verdict = run(operation, response, store)?;
        if verdict.is_terminal() {
            return Ok(verdict);
        }
    }
    Ok(Verdict::Continue)
}

fn run(
    operation: &Operation,
    response: &ResponseSnapshot,
    store: &PluginStore,
) -> Result<Verdict> {
    match operation {
        Operation::NextStage(Some(name)) => Ok(Verdict::Next(name.clone())),
        Operation::NextStage(None) => Ok(Verdict::Stop),
        Operation::Error(message) => Ok(Verdict::Error(message.clone())),
        Operation::Print(items) => {
            for item in items {
                match item {
                    Part::Literal(text) => println!("{text}"),
                    Part::Plugin(plugin) => match store.get(plugin.name()) {
                        Some(value) => println!("{} = {}", plugin.name(), value),
                        None => println!("{} = <absent>", plugin.name()),
                    },
                }
            }
            Ok(Verdict::Continue)
        }
        Operation::PrintBody => {
            println!("\nHTTP response body:\n{}", response.body());
            Ok(Verdict::Continue)
        }
        Operation::PrintHeaders(names) => {
            println!("HTTP response headers:");
            match names {
                Some(names) => {
                    for name in names {
                        if let Some(value) = response.header(name) {
                            println!("{name}: {value}");
                        }
                    }
                }
                None => {
                    for (name, value) in response.headers() {
                        println!("{name}: {value}");
                    }
                }
            }
            Ok(Verdict::Continue)
        }
        Operation::PrintCookies(names) => {
            println!("HTTP response cookies:");
            for (name, value) in response.set_cookie_pairs() {
                let wanted = names
                    .as_ref()
                    .map(|names| names.iter().any(|n| n == &name))
                    .unwrap_or(true);
                if wanted {
                    println!("{name}: {value}");
                }
            }
            Ok(Verdict::Continue)
        }
        Operation::Save {
            path,
            source,
            append,
        } => {
            let content = match source {
                SaveSource::Body => Some(response.body().to_string()),
                SaveSource::Plugin(plugin) => {
                    let value = store.get(plugin.name()).map(str::to_string);
                    if value.is_none() {
                        warn!(plugin = %plugin.name(), "nothing to save, plugin has no value");
                    }
                    value
                }
            };
            if let Some(content) = content {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(*append)
                    .write(true)
                    .truncate(!*append)
                    .open(path)?;
                file.write_all(content.as_bytes())?;
                file.write_all(b"\n")?;
                debug!(path = %path.display(), append, "saved data");
            }
            Ok(Verdict::Continue)
        }
        Operation::Http {
            status,
            action,
            otherwise,
        } => {
            let branch = if *status == response.status() {
                action
            } else {
                otherwise
            };
            evaluate(branch, response, store)
        }
        Operation::Grep {
            pattern,
            action,
            otherwise,
        } => {
            let branch = if pattern.is_match(response.body()) {
                action
            } else {
                otherwise
            };
            evaluate(branch, response, store)
        }
    }
}
