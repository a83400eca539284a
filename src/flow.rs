//! One stage of the authentication state machine: a request template, the
//! outputs to extract from its response, and the operations deciding what
//! happens next.

use tracing::debug;

use crate::errors::Result;
use crate::operations::{self, Operation, Verdict};
use crate::plugins::Plugin;
use crate::request::Request;
use crate::session::Session;

/// A named HTTP exchange. Read-only after construction; all mutation lands
/// in the session.
#[derive(Debug, Clone)]
pub struct Flow {
    name: String,
    request: Request,
    outputs: Vec<Plugin>,
    operations: Vec<Operation>,
}

impl Flow {
    pub fn new(name: impl Into<String>, request: Request) -> Self {
        Self {
            name: name.into(),
            request,
            outputs: Vec::new(),
            operations: Vec::new(),
        }
    }

    /// Declares an output plugin to bind from the response.
    pub fn output(mut self, plugin: Plugin) -> Self {
        self.outputs.push(plugin);
        self
    }

    /// Appends an operation; operations evaluate in declared order.
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outputs(&self) -> &[Plugin] {
        &self.outputs
    }

    /// Materialises the request, performs the round-trip, binds the declared
    /// outputs, then evaluates the operations against the response.
    pub async fn run(&self, session: &mut Session, base_url: Option<&str>) -> Result<Verdict> {
        debug!(flow = %self.name, "executing flow");
        let mut prepared = {
            let ctx = session.resolve_ctx();
            self.request.prepare(base_url, &ctx)?
        };
        session.absorb_resolved(std::mem::take(&mut prepared.resolved));
        let response = session.send(prepared).await?;
        session.bind_outputs(&self.outputs, &response);
        operations::evaluate(&self.operations, &response, session.store())
    }
}
