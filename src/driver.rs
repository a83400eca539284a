//! Top-level entry point owning a graph and its session.

use std::path::Path;

use crate::errors::{Error, Result};
use crate::graph::AuthGraph;
use crate::http::TransportConfig;
use crate::plugins::PromptFn;
use crate::runner::{RunOutcome, Runner};
use crate::session::Session;
use crate::user::User;
use crate::DEFAULT_MAX_TRANSITIONS;

/// Knobs for a [`Raider`] instance. All fields default.
#[derive(Clone)]
pub struct RaiderConfig {
    pub transport: TransportConfig,
    /// Index into the graph's user list selecting the active user.
    pub active_user: usize,
    /// Loop-guard bound on stage transitions.
    pub max_transitions: usize,
    /// Override the terminal prompt used by prompt plugins.
    pub prompt: Option<PromptFn>,
}

impl Default for RaiderConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            active_user: 0,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
            prompt: None,
        }
    }
}

/// Owns an immutable [`AuthGraph`] and the mutable [`Session`] a run
/// accumulates state into.
///
/// # Example
///
/// ```rust,ignore
/// use raider::{AuthGraph, Flow, Operation, Plugin, Raider, Request};
///
/// let graph = AuthGraph::builder()
///     .base_url("https://target.example")
///     .flow(
///         Flow::new("initialization", Request::get_path("/login"))
///             .output(Plugin::cookie("sid"))
///             .operation(Operation::next_stage("login")),
///     )
///     .flow(
///         Flow::new("login", Request::post_path("/login")
///             .cookie(Plugin::cookie("sid"))
///             .form("username", Plugin::variable("username"))
///             .form("password", Plugin::variable("password")))
///             .operation(Operation::http_else(
///                 200,
///                 vec![Operation::stop()],
///                 vec![Operation::error("login failed")],
///             )),
///     )
///     .user(raider::User::new("alice", "hunter2"))
///     .build()?;
///
/// let mut raider = Raider::new(graph)?;
/// let outcome = raider.authenticate().await;
/// std::process::exit(outcome.exit_code());
/// ```
pub struct Raider {
    graph: AuthGraph,
    session: Session,
    max_transitions: usize,
}

impl Raider {
    pub fn new(graph: AuthGraph) -> Result<Self> {
        Self::with_config(graph, RaiderConfig::default())
    }

    pub fn with_config(graph: AuthGraph, config: RaiderConfig) -> Result<Self> {
        let user = active_user(&graph, config.active_user)?;
        let mut session = Session::new(user, config.transport)?;
        if let Some(prompt) = config.prompt {
            session = session.with_prompt(prompt);
        }
        Ok(Self {
            graph,
            session,
            max_transitions: config.max_transitions,
        })
    }

    /// Switches the active user for subsequent runs.
    pub fn select_user(&mut self, index: usize) -> Result<()> {
        let user = active_user(&self.graph, index)?;
        self.session.set_user(user);
        Ok(())
    }

    /// Runs the authentication graph from the start.
    pub async fn authenticate(&mut self) -> RunOutcome {
        Runner::new(&self.graph, &mut self.session)
            .with_max_transitions(self.max_transitions)
            .authenticate()
            .await
    }

    /// Runs a named function flow. Advisory: call after authentication so
    /// the session carries the cookies and tokens the function expects.
    pub async fn run_function(&mut self, name: &str) -> RunOutcome {
        Runner::new(&self.graph, &mut self.session)
            .with_max_transitions(self.max_transitions)
            .run_function(name)
            .await
    }

    pub fn graph(&self) -> &AuthGraph {
        &self.graph
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Persists the session's cookie jar and plugin-value store into a
    /// project directory.
    pub fn dump_session(&self, dir: impl AsRef<Path>) -> Result<()> {
        self.session.dump(dir)
    }

    /// Restores a previously dumped session.
    pub fn load_session(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        self.session.load(dir)
    }
}

fn active_user(graph: &AuthGraph, index: usize) -> Result<User> {
    if graph.users().is_empty() {
        return Ok(User::default());
    }
    graph
        .users()
        .get(index)
        .cloned()
        .ok_or_else(|| Error::config(format!("no user at index {index}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;
    use crate::request::Request;

    fn graph_with_users() -> AuthGraph {
        AuthGraph::builder()
            .flow(Flow::new("init", Request::get("https://example.com/")))
            .user(User::new("alice", "a"))
            .user(User::new("bob", "b"))
            .build()
            .unwrap()
    }

    #[test]
    fn active_user_defaults_to_first() {
        let raider = Raider::new(graph_with_users()).unwrap();
        assert_eq!(raider.session().user().username(), "alice");
    }

    #[test]
    fn user_index_is_validated() {
        let config = RaiderConfig {
            active_user: 5,
            ..Default::default()
        };
        assert!(Raider::with_config(graph_with_users(), config).is_err());

        let mut raider = Raider::new(graph_with_users()).unwrap();
        raider.select_user(1).unwrap();
        assert_eq!(raider.session().user().username(), "bob");
        assert!(raider.select_user(9).is_err());
    }
}
