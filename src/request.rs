//! Request templates: one per flow, lowered to a concrete HTTP message at
//! send time by splicing in plugin values.

use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{Error, Result};
use crate::plugins::{Part, Plugin, ResolveCtx};

/// Request target: an absolute URL, or a path joined onto the graph's base URL.
#[derive(Debug, Clone)]
pub enum Target {
    Url(String),
    Path(String),
}

/// Request body encoding.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    None,
    /// Key/value map; both keys and values may be literals or plugin
    /// references. On GET the fields become query parameters, otherwise a
    /// form-urlencoded body.
    Form(Vec<(Part, Part)>),
    Raw(String),
    Json(serde_json::Value),
}

/// Template for one HTTP exchange.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: Target,
    cookies: Vec<Plugin>,
    headers: Vec<Plugin>,
    body: Body,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            target: Target::Url(url.into()),
            cookies: Vec::new(),
            headers: Vec::new(),
            body: Body::None,
        }
    }

    pub fn new_path(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            target: Target::Path(path.into()),
            cookies: Vec::new(),
            headers: Vec::new(),
            body: Body::None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn get_path(path: impl Into<String>) -> Self {
        Self::new_path(Method::GET, path)
    }

    pub fn post_path(path: impl Into<String>) -> Self {
        Self::new_path(Method::POST, path)
    }

    /// Adds a cookie plugin; sent as `name=value` when it resolves.
    pub fn cookie(mut self, plugin: Plugin) -> Self {
        self.cookies.push(plugin);
        self
    }

    /// Adds a header plugin; sent as `name: value` when it resolves.
    pub fn header(mut self, plugin: Plugin) -> Self {
        self.headers.push(plugin);
        self
    }

    /// Appends one form field; switches the body to the key/value encoding.
    pub fn form(mut self, key: impl Into<Part>, value: impl Into<Part>) -> Self {
        match &mut self.body {
            Body::Form(fields) => fields.push((key.into(), value.into())),
            _ => self.body = Body::Form(vec![(key.into(), value.into())]),
        }
        self
    }

    pub fn json_body(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn raw_body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Raw(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Lowers the template to a concrete message.
    ///
    /// Unresolvable plugins are non-fatal: the field is omitted and a warning
    /// is logged. The returned `resolved` list carries every successfully
    /// resolved (plugin name, value) pair so the caller can refresh the
    /// plugin-value store.
    pub(crate) fn prepare(
        &self,
        base_url: Option<&str>,
        ctx: &ResolveCtx<'_>,
    ) -> Result<PreparedRequest> {
        let raw_url = match &self.target {
            Target::Url(url) => url.clone(),
            Target::Path(path) => {
                let base = base_url.ok_or_else(|| {
                    Error::config("request uses a relative path but no base url is configured")
                })?;
                join_base(base, path)
            }
        };
        let mut url = Url::parse(&raw_url)
            .map_err(|err| Error::config(format!("invalid request url \"{raw_url}\": {err}")))?;

        let mut resolved = Vec::new();

        let mut headers = Vec::new();
        for plugin in &self.headers {
            match plugin.resolve_input(ctx) {
                Some(value) => {
                    resolved.push((plugin.name().to_string(), value.clone()));
                    headers.push((plugin.name().to_string(), value));
                }
                None => warn!(plugin = %plugin.name(), "could not resolve request header"),
            }
        }

        let mut cookies = Vec::new();
        for plugin in &self.cookies {
            match plugin.resolve_input(ctx) {
                Some(value) => {
                    resolved.push((plugin.name().to_string(), value.clone()));
                    cookies.push((plugin.name().to_string(), value));
                }
                None => warn!(plugin = %plugin.name(), "could not resolve request cookie"),
            }
        }

        let mut body = match &self.body {
            Body::None => PreparedBody::None,
            Body::Raw(raw) => PreparedBody::Raw(raw.clone()),
            Body::Json(value) => PreparedBody::Json(value.clone()),
            Body::Form(entries) => {
                let mut fields = Vec::new();
                for (key, value) in entries {
                    let Some(key) = resolve_part(key, ctx, &mut resolved) else {
                        continue;
                    };
                    let Some(value) = resolve_part(value, ctx, &mut resolved) else {
                        continue;
                    };
                    fields.push((key, value));
                }
                PreparedBody::Form(fields)
            }
        };

        if self.method == Method::GET {
            if let PreparedBody::Form(fields) = body {
                append_query(&mut url, &fields);
                body = PreparedBody::None;
            }
        }

        debug!(method = %self.method, %url, "prepared request");
        Ok(PreparedRequest {
            method: self.method.clone(),
            url,
            headers,
            cookies,
            body,
            resolved,
        })
    }
}

/// Joins a base URL and a path with exactly one `/` at the seam.
fn join_base(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn resolve_part(
    part: &Part,
    ctx: &ResolveCtx<'_>,
    resolved: &mut Vec<(String, String)>,
) -> Option<String> {
    match part {
        Part::Literal(value) => Some(value.clone()),
        Part::Plugin(plugin) => match plugin.resolve_input(ctx) {
            Some(value) => {
                resolved.push((plugin.name().to_string(), value.clone()));
                Some(value)
            }
            None => {
                warn!(plugin = %plugin.name(), "could not resolve form field, omitting entry");
                None
            }
        },
    }
}

fn append_query(url: &mut Url, fields: &[(String, String)]) {
    if fields.is_empty() {
        return;
    }
    let encoded = fields
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    let merged = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
        _ => encoded,
    };
    url.set_query(Some(&merged));
}

/// A fully materialised request, ready for the transport.
#[derive(Debug)]
pub(crate) struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: PreparedBody,
    /// Every (plugin name, value) resolved during preparation.
    pub resolved: Vec<(String, String)>,
}

#[derive(Debug)]
pub(crate) enum PreparedBody {
    None,
    Form(Vec<(String, String)>),
    Raw(String),
    Json(serde_json::Value),
}
