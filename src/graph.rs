//! The authentication graph: an immutable value built once by the
//! configuration front-end and handed to the runner.

use std::collections::{HashMap, HashSet};

use url::Url;

use crate::errors::{Error, Result};
use crate::flow::Flow;
use crate::user::User;

/// Ordered authentication flows, standalone function flows, the user list,
/// and the optional base URL for path-relative requests.
///
/// Stage names resolve through an index built at construction, so a
/// `NextStage` verdict is a map lookup rather than a scan.
#[derive(Debug)]
pub struct AuthGraph {
    flows: Vec<Flow>,
    flow_index: HashMap<String, usize>,
    functions: Vec<Flow>,
    function_index: HashMap<String, usize>,
    users: Vec<User>,
    base_url: Option<String>,
}

impl AuthGraph {
    pub fn builder() -> AuthGraphBuilder {
        AuthGraphBuilder::default()
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn flow_position(&self, name: &str) -> Option<usize> {
        self.flow_index.get(name).copied()
    }

    pub fn flow_at(&self, index: usize) -> Option<&Flow> {
        self.flows.get(index)
    }

    pub fn function(&self, name: &str) -> Option<&Flow> {
        self.function_index
            .get(name)
            .and_then(|&index| self.functions.get(index))
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }
}

#[derive(Debug, Default)]
pub struct AuthGraphBuilder {
    flows: Vec<Flow>,
    functions: Vec<Flow>,
    users: Vec<User>,
    base_url: Option<String>,
}

impl AuthGraphBuilder {
    /// Appends an authentication stage; order defines the default sequence.
    pub fn flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    /// Appends a standalone function flow, invocable by name.
    pub fn function(mut self, flow: Flow) -> Self {
        self.functions.push(flow);
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.users.push(user);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Validates and freezes the graph.
    ///
    /// Rejected here, not at run time: duplicate flow names (across the
    /// authentication and function lists), duplicate output names within one
    /// flow, outputs that cannot be bound from a response, and an
    /// unparseable base URL.
    pub fn build(self) -> Result<AuthGraph> {
        if let Some(base_url) = &self.base_url {
            Url::parse(base_url)
                .map_err(|err| Error::config(format!("invalid base url \"{base_url}\": {err}")))?;
        }

        let mut seen = HashSet::new();
        let mut flow_index = HashMap::new();
        for (position, flow) in self.flows.iter().enumerate() {
            if !seen.insert(flow.name().to_string()) {
                return Err(Error::config(format!("duplicate flow name: {}", flow.name())));
            }
            flow_index.insert(flow.name().to_string(), position);
            validate_outputs(flow)?;
        }
        let mut function_index = HashMap::new();
        for (position, flow) in self.functions.iter().enumerate() {
            if !seen.insert(flow.name().to_string()) {
                return Err(Error::config(format!("duplicate flow name: {}", flow.name())));
            }
            function_index.insert(flow.name().to_string(), position);
            validate_outputs(flow)?;
        }

        Ok(AuthGraph {
            flows: self.flows,
            flow_index,
            functions: self.functions,
            function_index,
            users: self.users,
            base_url: self.base_url,
        })
    }
}

fn validate_outputs(flow: &Flow) -> Result<()> {
    let mut names = HashSet::new();
    for output in flow.outputs() {
        if !names.insert(output.name()) {
            return Err(Error::config(format!(
                "flow \"{}\" declares output \"{}\" twice",
                flow.name(),
                output.name()
            )));
        }
        if !output.needs_response() && !output.depends_on_other_plugins() {
            return Err(Error::config(format!(
                "flow \"{}\" output \"{}\" cannot be bound from a response",
                flow.name(),
                output.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::Plugin;
    use crate::request::Request;

    fn flow(name: &str) -> Flow {
        Flow::new(name, Request::get("https://example.com/"))
    }

    #[test]
    fn duplicate_flow_names_are_rejected() {
        let err = AuthGraph::builder()
            .flow(flow("init"))
            .flow(flow("init"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate flow name"));
    }

    #[test]
    fn function_names_share_the_namespace() {
        let err = AuthGraph::builder()
            .flow(flow("init"))
            .function(flow("init"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate flow name"));
    }

    #[test]
    fn non_extractable_output_is_rejected() {
        let err = AuthGraph::builder()
            .flow(flow("init").output(Plugin::variable("username")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cannot be bound"));
    }

    #[test]
    fn name_index_resolves_stages_and_functions() {
        let graph = AuthGraph::builder()
            .flow(flow("init"))
            .flow(flow("login"))
            .function(flow("logout"))
            .base_url("https://example.com")
            .build()
            .unwrap();
        assert_eq!(graph.flow_position("login"), Some(1));
        assert_eq!(graph.flow_position("logout"), None);
        assert!(graph.function("logout").is_some());
        assert_eq!(graph.base_url(), Some("https://example.com"));
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let err = AuthGraph::builder()
            .base_url("not a url")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("invalid base url"));
    }
}
