//! Engine for testing web authentication.
//!
//! An operator describes a site's login as a directed graph of HTTP
//! exchanges. Each [`Flow`] sends one request built from [`Plugin`] values
//! (credentials, cookies, CSRF tokens, prompted secrets), extracts new
//! values from the response, and evaluates [`Operation`]s that decide the
//! next stage. The [`Runner`] drives the graph to completion; the
//! [`Session`] accumulates cookies and plugin values along the way.

/// Default User-Agent header value.
pub const DEFAULT_USER_AGENT: &str = concat!("raider/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default request timeout (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Default loop-guard bound on stage transitions in one run.
pub const DEFAULT_MAX_TRANSITIONS: usize = 25;

mod driver;
mod errors;
mod flow;
mod graph;
mod http;
mod operations;
mod plugins;
mod request;
mod runner;
mod session;
mod user;

pub use driver::{Raider, RaiderConfig};
pub use errors::{Error, Result};
pub use flow::Flow;
pub use graph::{AuthGraph, AuthGraphBuilder};
pub use http::{CookieJar, CookieRecord, ResponseSnapshot, TransportConfig};
pub use operations::{Operation, SaveSource, Verdict};
pub use plugins::{
    AttrMatch, CookieSource, HeaderSource, HtmlQuery, JsonPath, Part, Plugin, PluginFlags,
    PluginKind, PromptFn, ResolveCtx, ResponseExtractor, Transform, UrlComponent,
};
pub use request::{Body, Request, Target};
pub use runner::{Outcome, RunOutcome, RunStats, Runner};
pub use session::{PluginStore, Session};
pub use user::User;
