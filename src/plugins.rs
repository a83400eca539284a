//! Named value carriers spliced into requests and filled from responses.
//!
//! A [`Plugin`] owns a name, a kind, and a set of capability flags. Used as a
//! request input it resolves to a string through [`Plugin::resolve_input`];
//! declared as a flow output it extracts its value from the HTTP response
//! through [`Plugin::extract_output`]. Values move between stages through the
//! session's plugin-value store.

use std::fmt;
use std::io::{self, BufRead, Write as _};
use std::process::Command as ShellCommand;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use scraper::{Html as HtmlDocument, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::errors::{Error, Result};
use crate::http::ResponseSnapshot;
use crate::session::PluginStore;
use crate::user::User;

/// Capability bits describing what a plugin needs in order to produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginFlags(u8);

impl PluginFlags {
    pub const NONE: PluginFlags = PluginFlags(0);
    /// The value comes from a field of the active user.
    pub const NEEDS_USERDATA: PluginFlags = PluginFlags(0x01);
    /// The value originates from an HTTP response.
    pub const NEEDS_RESPONSE: PluginFlags = PluginFlags(0x02);
    /// The value derives from other plugin values at resolution time.
    pub const DEPENDS_ON_OTHER_PLUGINS: PluginFlags = PluginFlags(0x04);

    pub fn contains(self, other: PluginFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PluginFlags {
    type Output = PluginFlags;

    fn bitor(self, rhs: PluginFlags) -> PluginFlags {
        PluginFlags(self.0 | rhs.0)
    }
}

/// Callback reading a prompted secret from the operator.
///
/// Receives the plugin name, returns `None` when no input could be obtained.
pub type PromptFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Callback extracting a value straight from a response snapshot.
pub type ResponseExtractor = Arc<dyn Fn(&ResponseSnapshot) -> Option<String> + Send + Sync>;

/// Default prompt: reads one non-empty line from the terminal.
pub(crate) fn stdin_prompt() -> PromptFn {
    Arc::new(|name| {
        let stdin = io::stdin();
        loop {
            println!("Please provide the input value");
            print!("{name} = ");
            io::stdout().flush().ok()?;
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    let value = line.trim_end_matches(['\r', '\n']);
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    })
}

/// Everything a plugin may consult while resolving as a request input.
pub struct ResolveCtx<'a> {
    pub user: &'a User,
    pub store: &'a PluginStore,
    pub prompt: &'a PromptFn,
}

/// Predicate over an HTML attribute value, normalised at construction.
#[derive(Debug, Clone)]
pub enum AttrMatch {
    Exact(String),
    Pattern(Regex),
}

impl AttrMatch {
    pub fn exact(value: impl Into<String>) -> Self {
        AttrMatch::Exact(value.into())
    }

    /// Patterns are anchored at the start of the attribute value; append `$`
    /// to require a full match.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(AttrMatch::Pattern(Regex::new(&format!("^(?:{pattern})"))?))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            AttrMatch::Exact(expected) => expected == value,
            AttrMatch::Pattern(re) => re.is_match(value),
        }
    }
}

/// Either a literal string or a plugin reference.
///
/// Used wherever the graph accepts both: combine parts, request form keys and
/// values, print items, replacement targets.
#[derive(Debug, Clone)]
pub enum Part {
    Literal(String),
    Plugin(Plugin),
}

impl From<&str> for Part {
    fn from(value: &str) -> Self {
        Part::Literal(value.to_string())
    }
}

impl From<String> for Part {
    fn from(value: String) -> Self {
        Part::Literal(value)
    }
}

impl From<Plugin> for Part {
    fn from(value: Plugin) -> Self {
        Part::Plugin(value)
    }
}

/// Post-processing applied by an `Alter` plugin to its source value.
#[derive(Clone)]
pub enum Transform {
    Prepend(String),
    Append(String),
    Replace { from: String, to: Box<Part> },
    Custom(Arc<dyn Fn(&str) -> Option<String> + Send + Sync>),
}

impl Transform {
    pub fn prepend(prefix: impl Into<String>) -> Self {
        Transform::Prepend(prefix.into())
    }

    pub fn append(suffix: impl Into<String>) -> Self {
        Transform::Append(suffix.into())
    }

    pub fn replace(from: impl Into<String>, to: impl Into<Part>) -> Self {
        Transform::Replace {
            from: from.into(),
            to: Box::new(to.into()),
        }
    }

    fn apply(&self, value: &str, ctx: &ResolveCtx<'_>) -> Option<String> {
        match self {
            Transform::Prepend(prefix) => Some(format!("{prefix}{value}")),
            Transform::Append(suffix) => Some(format!("{value}{suffix}")),
            Transform::Replace { from, to } => {
                let replacement = match to.as_ref() {
                    Part::Literal(s) => s.clone(),
                    Part::Plugin(p) => p.resolve_input(ctx)?,
                };
                Some(value.replace(from, &replacement))
            }
            Transform::Custom(f) => f(value),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Prepend(s) => f.debug_tuple("Prepend").field(s).finish(),
            Transform::Append(s) => f.debug_tuple("Append").field(s).finish(),
            Transform::Replace { from, to } => f
                .debug_struct("Replace")
                .field("from", from)
                .field("to", to)
                .finish(),
            Transform::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// URL component selected by a `UrlParser` plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlComponent {
    Scheme,
    /// Host, with the port appended when the URL carries an explicit one.
    Host,
    Path,
    /// A single query parameter by key.
    Query(String),
    Fragment,
}

/// Parsed dotted path into a JSON document.
///
/// Supports dots, `[n]` array indexing, and double-quoted segments for keys
/// containing dots or spaces: `production.keys[1]."with space"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    steps: Vec<JsonStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JsonStep {
    Key(String),
    Index(usize),
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self> {
        let mut steps = Vec::new();
        let mut chars = path.chars().peekable();
        while let Some(&c) = chars.peek() {
            match c {
                '.' => {
                    chars.next();
                }
                '"' => {
                    chars.next();
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some(c) => key.push(c),
                            None => {
                                return Err(Error::config(format!(
                                    "unterminated quoted key in json path: {path}"
                                )))
                            }
                        }
                    }
                    steps.push(JsonStep::Key(key));
                }
                '[' => {
                    chars.next();
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(c) if c.is_ascii_digit() => digits.push(c),
                            _ => {
                                return Err(Error::config(format!(
                                    "invalid array index in json path: {path}"
                                )))
                            }
                        }
                    }
                    let index = digits.parse().map_err(|_| {
                        Error::config(format!("invalid array index in json path: {path}"))
                    })?;
                    steps.push(JsonStep::Index(index));
                }
                _ => {
                    let mut key = String::new();
                    while let Some(&c) = chars.peek() {
                        if c == '.' || c == '[' {
                            break;
                        }
                        key.push(c);
                        chars.next();
                    }
                    steps.push(JsonStep::Key(key));
                }
            }
        }
        if steps.is_empty() {
            return Err(Error::config("empty json path"));
        }
        Ok(Self { steps })
    }

    fn lookup<'v>(&self, value: &'v serde_json::Value) -> Option<&'v serde_json::Value> {
        let mut current = value;
        for step in &self.steps {
            current = match step {
                JsonStep::Key(key) => current.get(key.as_str())?,
                JsonStep::Index(index) => current.get(index)?,
            };
        }
        Some(current)
    }
}

/// Compiled HTML tag query: tag name, attribute predicates, extraction target.
#[derive(Debug, Clone)]
pub struct HtmlQuery {
    selector: Selector,
    attributes: Vec<(String, AttrMatch)>,
    /// Attribute to extract, or `"data"` for the tag's inner text.
    extract: String,
}

impl HtmlQuery {
    fn new(tag: &str, attributes: Vec<(String, AttrMatch)>, extract: String) -> Result<Self> {
        let selector = Selector::parse(tag)
            .map_err(|err| Error::config(format!("invalid html tag \"{tag}\": {err}")))?;
        Ok(Self {
            selector,
            attributes,
            extract,
        })
    }

    /// First tag in document order whose attributes all match wins.
    fn extract(&self, body: &str) -> Option<String> {
        let document = HtmlDocument::parse_document(body);
        for element in document.select(&self.selector) {
            let matched = self.attributes.iter().all(|(name, predicate)| {
                element
                    .value()
                    .attr(name)
                    .map(|value| predicate.matches(value))
                    .unwrap_or(false)
            });
            if !matched {
                continue;
            }
            return if self.extract == "data" {
                Some(element.text().collect())
            } else {
                element.value().attr(&self.extract).map(str::to_string)
            };
        }
        None
    }
}

/// Where a request cookie takes its value from.
#[derive(Debug, Clone)]
pub enum CookieSource {
    /// Extracted from a response `Set-Cookie` by name; sent from the store.
    Response,
    Literal(String),
    Plugin(Box<Plugin>),
}

/// Where a request header takes its value from.
#[derive(Debug, Clone)]
pub enum HeaderSource {
    /// Extracted from a response header by name; sent from the store.
    Response,
    Literal(String),
    BasicAuth {
        username: Box<Plugin>,
        password: Box<Plugin>,
    },
    Bearer(Box<Plugin>),
    Plugin(Box<Plugin>),
}

#[derive(Clone)]
pub enum PluginKind {
    Variable,
    Prompt,
    Command { command: String },
    Cookie { source: CookieSource },
    Header { source: HeaderSource },
    Regex { pattern: Regex, group: usize },
    Html { query: HtmlQuery },
    Json { path: JsonPath },
    Empty,
    Alter { source: Box<Plugin>, transform: Transform },
    Combine { parts: Vec<Part> },
    UrlParser { source: Box<Plugin>, component: UrlComponent },
    Custom { extractor: ResponseExtractor },
}

impl fmt::Debug for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Variable => f.write_str("Variable"),
            PluginKind::Prompt => f.write_str("Prompt"),
            PluginKind::Command { command } => {
                f.debug_struct("Command").field("command", command).finish()
            }
            PluginKind::Cookie { source } => {
                f.debug_struct("Cookie").field("source", source).finish()
            }
            PluginKind::Header { source } => {
                f.debug_struct("Header").field("source", source).finish()
            }
            PluginKind::Regex { pattern, group } => f
                .debug_struct("Regex")
                .field("pattern", &pattern.as_str())
                .field("group", group)
                .finish(),
            PluginKind::Html { query } => f.debug_struct("Html").field("query", query).finish(),
            PluginKind::Json { path } => f.debug_struct("Json").field("path", path).finish(),
            PluginKind::Empty => f.write_str("Empty"),
            PluginKind::Alter { source, transform } => f
                .debug_struct("Alter")
                .field("source", source)
                .field("transform", transform)
                .finish(),
            PluginKind::Combine { parts } => {
                f.debug_struct("Combine").field("parts", parts).finish()
            }
            PluginKind::UrlParser { source, component } => f
                .debug_struct("UrlParser")
                .field("source", source)
                .field("component", component)
                .finish(),
            PluginKind::Custom { .. } => f.write_str("Custom(..)"),
        }
    }
}

/// A named, typed value carrier.
#[derive(Debug, Clone)]
pub struct Plugin {
    name: String,
    kind: PluginKind,
    flags: PluginFlags,
}

impl Plugin {
    fn with_flags(name: impl Into<String>, kind: PluginKind, flags: PluginFlags) -> Self {
        Self {
            name: name.into(),
            kind,
            flags,
        }
    }

    /// Reads the field of the same name from the active user.
    pub fn variable(name: impl Into<String>) -> Self {
        Self::with_flags(name, PluginKind::Variable, PluginFlags::NEEDS_USERDATA)
    }

    /// Asks the operator for the value; cached in the store after the first read.
    pub fn prompt(name: impl Into<String>) -> Self {
        Self::with_flags(name, PluginKind::Prompt, PluginFlags::NONE)
    }

    /// Runs a shell command and captures stdout, stripped of the trailing newline.
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_flags(
            name,
            PluginKind::Command {
                command: command.into(),
            },
            PluginFlags::NONE,
        )
    }

    /// As output: picks the response cookie with this name. As input: emits
    /// the stored value as a `name=value` pair.
    pub fn cookie(name: impl Into<String>) -> Self {
        Self::with_flags(
            name,
            PluginKind::Cookie {
                source: CookieSource::Response,
            },
            PluginFlags::NEEDS_RESPONSE,
        )
    }

    pub fn cookie_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_flags(
            name,
            PluginKind::Cookie {
                source: CookieSource::Literal(value.into()),
            },
            PluginFlags::NONE,
        )
    }

    /// Cookie whose value comes from another plugin.
    pub fn cookie_from(name: impl Into<String>, source: Plugin) -> Self {
        Self::with_flags(
            name,
            PluginKind::Cookie {
                source: CookieSource::Plugin(Box::new(source)),
            },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// As output: picks the response header with this name. As input: emits
    /// the stored value as a `name: value` pair.
    pub fn header(name: impl Into<String>) -> Self {
        Self::with_flags(
            name,
            PluginKind::Header {
                source: HeaderSource::Response,
            },
            PluginFlags::NEEDS_RESPONSE,
        )
    }

    pub fn header_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_flags(
            name,
            PluginKind::Header {
                source: HeaderSource::Literal(value.into()),
            },
            PluginFlags::NONE,
        )
    }

    /// Header whose value comes from another plugin.
    pub fn header_from(name: impl Into<String>, source: Plugin) -> Self {
        Self::with_flags(
            name,
            PluginKind::Header {
                source: HeaderSource::Plugin(Box::new(source)),
            },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// `Authorization: Basic <base64(username:password)>` built from two plugins.
    pub fn basic_auth(username: Plugin, password: Plugin) -> Self {
        Self::with_flags(
            "Authorization",
            PluginKind::Header {
                source: HeaderSource::BasicAuth {
                    username: Box::new(username),
                    password: Box::new(password),
                },
            },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// `Authorization: Bearer <token>` built from a token plugin.
    pub fn bearer_auth(token: Plugin) -> Self {
        Self::with_flags(
            "Authorization",
            PluginKind::Header {
                source: HeaderSource::Bearer(Box::new(token)),
            },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// Extracts the first capturing group of the first body match.
    pub fn regex(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::regex_group(name, pattern, 1)
    }

    /// Extracts a specific capturing group (1-based) of the first body match.
    pub fn regex_group(name: impl Into<String>, pattern: &str, group: usize) -> Result<Self> {
        Ok(Self::with_flags(
            name,
            PluginKind::Regex {
                pattern: Regex::new(pattern)?,
                group,
            },
            PluginFlags::NEEDS_RESPONSE,
        ))
    }

    /// Selects the first tag of `tag` whose attributes all satisfy their
    /// predicates; extracts the `extract` attribute, or the inner text when
    /// `extract` is `"data"`.
    pub fn html(
        name: impl Into<String>,
        tag: &str,
        attributes: Vec<(String, AttrMatch)>,
        extract: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::with_flags(
            name,
            PluginKind::Html {
                query: HtmlQuery::new(tag, attributes, extract.into())?,
            },
            PluginFlags::NEEDS_RESPONSE,
        ))
    }

    /// Extracts the value at a dotted path from a JSON body.
    pub fn json(name: impl Into<String>, path: &str) -> Result<Self> {
        Ok(Self::with_flags(
            name,
            PluginKind::Json {
                path: JsonPath::parse(path)?,
            },
            PluginFlags::NEEDS_RESPONSE,
        ))
    }

    /// Placeholder with no intrinsic value; filled by assignment to the store.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::with_flags(name, PluginKind::Empty, PluginFlags::NEEDS_RESPONSE)
    }

    /// Wraps another plugin and post-processes its value.
    pub fn alter(name: impl Into<String>, source: Plugin, transform: Transform) -> Self {
        Self::with_flags(
            name,
            PluginKind::Alter {
                source: Box::new(source),
                transform,
            },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// Concatenates the values of the given parts in order.
    ///
    /// Parts resolving to absent contribute nothing.
    pub fn combine(name: impl Into<String>, parts: Vec<Part>) -> Self {
        Self::with_flags(
            name,
            PluginKind::Combine { parts },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// Extracts a URL component from another plugin's value.
    pub fn url_parser(name: impl Into<String>, source: Plugin, component: UrlComponent) -> Self {
        Self::with_flags(
            name,
            PluginKind::UrlParser {
                source: Box::new(source),
                component,
            },
            PluginFlags::DEPENDS_ON_OTHER_PLUGINS,
        )
    }

    /// Response extractor supplied by the caller.
    pub fn custom_extractor(name: impl Into<String>, extractor: ResponseExtractor) -> Self {
        Self::with_flags(
            name,
            PluginKind::Custom { extractor },
            PluginFlags::NEEDS_RESPONSE,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PluginKind {
        &self.kind
    }

    pub fn flags(&self) -> PluginFlags {
        self.flags
    }

    pub fn needs_userdata(&self) -> bool {
        self.flags.contains(PluginFlags::NEEDS_USERDATA)
    }

    pub fn needs_response(&self) -> bool {
        self.flags.contains(PluginFlags::NEEDS_RESPONSE)
    }

    pub fn depends_on_other_plugins(&self) -> bool {
        self.flags.contains(PluginFlags::DEPENDS_ON_OTHER_PLUGINS)
    }

    /// Resolves the plugin as a request input.
    ///
    /// Response-extracted kinds read their last bound value from the store;
    /// the rest compute from the user, the terminal, a shell command, or
    /// other plugin values. `None` means the value is absent; callers log a
    /// resolution warning and carry on.
    pub fn resolve_input(&self, ctx: &ResolveCtx<'_>) -> Option<String> {
        match &self.kind {
            PluginKind::Variable => match ctx.user.field(&self.name) {
                Some(value) => Some(value.to_string()),
                None => {
                    warn!(plugin = %self.name, "user record has no such field");
                    None
                }
            },
            PluginKind::Prompt => ctx
                .store
                .get(&self.name)
                .map(str::to_string)
                .or_else(|| (ctx.prompt)(&self.name)),
            PluginKind::Command { command } => run_command(&self.name, command),
            PluginKind::Cookie { source } => match source {
                CookieSource::Response => ctx.store.get(&self.name).map(str::to_string),
                CookieSource::Literal(value) => Some(value.clone()),
                CookieSource::Plugin(plugin) => plugin.resolve_input(ctx),
            },
            PluginKind::Header { source } => match source {
                HeaderSource::Response => ctx.store.get(&self.name).map(str::to_string),
                HeaderSource::Literal(value) => Some(value.clone()),
                HeaderSource::BasicAuth { username, password } => {
                    let username = username.resolve_input(ctx)?;
                    let password = password.resolve_input(ctx)?;
                    Some(format!(
                        "Basic {}",
                        BASE64.encode(format!("{username}:{password}"))
                    ))
                }
                HeaderSource::Bearer(token) => token
                    .resolve_input(ctx)
                    .map(|token| format!("Bearer {token}")),
                HeaderSource::Plugin(plugin) => plugin.resolve_input(ctx),
            },
            PluginKind::Regex { .. }
            | PluginKind::Html { .. }
            | PluginKind::Json { .. }
            | PluginKind::Empty
            | PluginKind::Custom { .. } => ctx.store.get(&self.name).map(str::to_string),
            PluginKind::Alter { source, transform } => source
                .resolve_input(ctx)
                .and_then(|value| transform.apply(&value, ctx)),
            PluginKind::Combine { parts } => {
                let mut combined = String::new();
                for part in parts {
                    match part {
                        Part::Literal(s) => combined.push_str(s),
                        Part::Plugin(p) => {
                            if let Some(value) = p.resolve_input(ctx) {
                                combined.push_str(&value);
                            }
                        }
                    }
                }
                Some(combined)
            }
            PluginKind::UrlParser { source, component } => {
                let value = source.resolve_input(ctx)?;
                url_component(&self.name, &value, component)
            }
        }
    }

    /// Extracts the plugin's value from the response.
    ///
    /// Only response-extractable kinds produce values here; derived plugins
    /// are bound through [`resolve_input`](Self::resolve_input) once their
    /// sources are in the store.
    pub fn extract_output(
        &self,
        response: &ResponseSnapshot,
        store: &PluginStore,
    ) -> Option<String> {
        match &self.kind {
            PluginKind::Cookie { .. } => response.set_cookie(&self.name),
            PluginKind::Header { .. } => response.header(&self.name).map(str::to_string),
            PluginKind::Regex { pattern, group } => match pattern.captures(response.body()) {
                Some(captures) => captures.get(*group).map(|m| m.as_str().to_string()),
                None => {
                    warn!(plugin = %self.name, "regex not found in the response body");
                    None
                }
            },
            PluginKind::Html { query } => query.extract(response.body()),
            PluginKind::Json { path } => {
                let value: serde_json::Value = match serde_json::from_str(response.body()) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(plugin = %self.name, %err, "response body is not valid json");
                        return None;
                    }
                };
                path.lookup(&value).map(json_to_string)
            }
            PluginKind::Empty => store.get(&self.name).map(str::to_string),
            PluginKind::Custom { extractor } => extractor(response),
            _ => {
                debug!(plugin = %self.name, "plugin kind does not extract from responses");
                None
            }
        }
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn run_command(name: &str, command: &str) -> Option<String> {
    match ShellCommand::new("sh").arg("-c").arg(command).output() {
        Ok(output) => {
            if !output.status.success() {
                warn!(plugin = %name, status = %output.status, "command exited with failure");
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            Some(stdout.trim_end_matches('\n').to_string())
        }
        Err(err) => {
            warn!(plugin = %name, %err, "failed to run command");
            None
        }
    }
}

fn url_component(name: &str, value: &str, component: &UrlComponent) -> Option<String> {
    let parsed = match Url::parse(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(plugin = %name, %err, "value is not a parseable url");
            return None;
        }
    };
    match component {
        UrlComponent::Scheme => Some(parsed.scheme().to_string()),
        UrlComponent::Host => parsed.host_str().map(|host| match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }),
        UrlComponent::Path => Some(parsed.path().to_string()),
        UrlComponent::Query(key) => parsed
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned()),
        UrlComponent::Fragment => parsed.fragment().map(str::to_string),
    }
}

fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseSnapshot;
    use crate::session::PluginStore;

    fn ctx<'a>(user: &'a User, store: &'a PluginStore, prompt: &'a PromptFn) -> ResolveCtx<'a> {
        ResolveCtx {
            user,
            store,
            prompt,
        }
    }

    fn no_prompt() -> PromptFn {
        Arc::new(|_| None)
    }

    #[test]
    fn variable_reads_user_field() {
        let user = User::new("alice", "hunter2");
        let store = PluginStore::default();
        let prompt = no_prompt();
        let ctx = ctx(&user, &store, &prompt);

        assert_eq!(
            Plugin::variable("username").resolve_input(&ctx),
            Some("alice".to_string())
        );
        assert_eq!(Plugin::variable("missing").resolve_input(&ctx), None);
    }

    #[test]
    fn prompt_prefers_cached_store_value() {
        let user = User::default();
        let mut store = PluginStore::default();
        store.set("mfa", "654321");
        let prompt: PromptFn = Arc::new(|_| Some("123456".to_string()));
        let ctx = ctx(&user, &store, &prompt);

        assert_eq!(
            Plugin::prompt("mfa").resolve_input(&ctx),
            Some("654321".to_string())
        );
    }

    #[test]
    fn prompt_falls_back_to_callback() {
        let user = User::default();
        let store = PluginStore::default();
        let prompt: PromptFn = Arc::new(|_| Some("123456".to_string()));
        let ctx = ctx(&user, &store, &prompt);

        assert_eq!(
            Plugin::prompt("mfa").resolve_input(&ctx),
            Some("123456".to_string())
        );
    }

    #[test]
    fn command_strips_trailing_newline() {
        let user = User::default();
        let store = PluginStore::default();
        let prompt = no_prompt();
        let ctx = ctx(&user, &store, &prompt);

        assert_eq!(
            Plugin::command("greeting", "echo hello").resolve_input(&ctx),
            Some("hello".to_string())
        );
    }

    #[test]
    fn basic_auth_encodes_credentials() {
        let user = User::new("aladdin", "opensesame");
        let store = PluginStore::default();
        let prompt = no_prompt();
        let ctx = ctx(&user, &store, &prompt);

        let header = Plugin::basic_auth(Plugin::variable("username"), Plugin::variable("password"));
        assert_eq!(header.name(), "Authorization");
        assert!(header.depends_on_other_plugins());
        assert_eq!(
            header.resolve_input(&ctx),
            Some("Basic YWxhZGRpbjpvcGVuc2VzYW1l".to_string())
        );
    }

    #[test]
    fn bearer_auth_absent_without_token() {
        let user = User::default();
        let mut store = PluginStore::default();
        let prompt = no_prompt();

        let header = Plugin::bearer_auth(Plugin::regex("access_token", "token=(\\w+)").unwrap());
        assert_eq!(header.resolve_input(&ctx(&user, &store, &prompt)), None);

        store.set("access_token", "TOK");
        assert_eq!(
            header.resolve_input(&ctx(&user, &store, &prompt)),
            Some("Bearer TOK".to_string())
        );
    }

    #[test]
    fn regex_extracts_first_capture_of_first_match() {
        let plugin = Plugin::regex("access_token", "\"accessToken\":\"([^\"]+)\"").unwrap();
        let response = ResponseSnapshot::new(
            200,
            vec![],
            "{\"accessToken\":\"TOK\"},{\"accessToken\":\"OTHER\"}".to_string(),
        );
        let store = PluginStore::default();
        assert_eq!(
            plugin.extract_output(&response, &store),
            Some("TOK".to_string())
        );
    }

    #[test]
    fn regex_without_match_is_absent() {
        let plugin = Plugin::regex("token", "token=(\\w+)").unwrap();
        let response = ResponseSnapshot::new(200, vec![], "nothing here".to_string());
        assert_eq!(plugin.extract_output(&response, &PluginStore::default()), None);
    }

    #[test]
    fn html_first_matching_tag_wins() {
        let body = r#"
            <form>
              <input type="text" name="other" value="nope">
              <input type="hidden" name="csrf_token" value="00112233445566778899aabbccddeeff00112233">
              <input type="hidden" name="csrf_token" value="ffeeddcc">
            </form>
        "#;
        let plugin = Plugin::html(
            "csrf_token",
            "input",
            vec![
                ("name".to_string(), AttrMatch::exact("csrf_token")),
                ("value".to_string(), AttrMatch::pattern("^[0-9a-f]{40}$").unwrap()),
                ("type".to_string(), AttrMatch::exact("hidden")),
            ],
            "value",
        )
        .unwrap();
        let response = ResponseSnapshot::new(200, vec![], body.to_string());
        assert_eq!(
            plugin.extract_output(&response, &PluginStore::default()),
            Some("00112233445566778899aabbccddeeff00112233".to_string())
        );
    }

    #[test]
    fn attribute_patterns_are_anchored_at_the_start() {
        let body = concat!(
            "<input name=\"csrf\" value=\"junk-00112233445566778899aabbccddeeff00112233\">",
            "<input name=\"csrf\" value=\"00112233445566778899aabbccddeeff00112233-trailing\">",
        );
        let plugin = Plugin::html(
            "csrf",
            "input",
            vec![(
                "value".to_string(),
                AttrMatch::pattern("[0-9a-f]{40}").unwrap(),
            )],
            "value",
        )
        .unwrap();
        let response = ResponseSnapshot::new(200, vec![], body.to_string());
        assert_eq!(
            plugin.extract_output(&response, &PluginStore::default()),
            Some("00112233445566778899aabbccddeeff00112233-trailing".to_string())
        );
    }

    #[test]
    fn html_inner_text_via_data() {
        let body = "<html><title id=\"t\">Welcome back</title></html>";
        let plugin = Plugin::html(
            "title",
            "title",
            vec![("id".to_string(), AttrMatch::exact("t"))],
            "data",
        )
        .unwrap();
        let response = ResponseSnapshot::new(200, vec![], body.to_string());
        assert_eq!(
            plugin.extract_output(&response, &PluginStore::default()),
            Some("Welcome back".to_string())
        );
    }

    #[test]
    fn json_dotted_path_with_index_and_quotes() {
        let body = r#"{"env":{"production":[{"field":"x"},{"field":"y"}]},"with space":{"k":7}}"#;
        let response = ResponseSnapshot::new(200, vec![], body.to_string());
        let store = PluginStore::default();

        let plugin = Plugin::json("field", "env.production[1].field").unwrap();
        assert_eq!(plugin.extract_output(&response, &store), Some("y".to_string()));

        let quoted = Plugin::json("k", "\"with space\".k").unwrap();
        assert_eq!(quoted.extract_output(&response, &store), Some("7".to_string()));

        let missing = Plugin::json("nope", "env.staging.field").unwrap();
        assert_eq!(missing.extract_output(&response, &store), None);
    }

    #[test]
    fn json_path_rejects_bad_input() {
        assert!(JsonPath::parse("").is_err());
        assert!(JsonPath::parse("a[x]").is_err());
        assert!(JsonPath::parse("\"unterminated").is_err());
    }

    #[test]
    fn alter_and_combine_resolution() {
        let user = User::default();
        let mut store = PluginStore::default();
        store.set("token", "abc");
        let prompt = no_prompt();
        let ctx = ctx(&user, &store, &prompt);

        let altered = Plugin::alter(
            "wrapped",
            Plugin::empty("token"),
            Transform::prepend("t-"),
        );
        assert_eq!(altered.resolve_input(&ctx), Some("t-abc".to_string()));

        let combined = Plugin::combine(
            "pair",
            vec![
                Part::from("id="),
                Part::from(Plugin::empty("token")),
                Part::from(Plugin::empty("missing")),
            ],
        );
        assert_eq!(combined.resolve_input(&ctx), Some("id=abc".to_string()));
    }

    #[test]
    fn replace_with_plugin_value() {
        let user = User::default();
        let mut store = PluginStore::default();
        store.set("template", "user: NAME");
        store.set("name", "alice");
        let prompt = no_prompt();
        let ctx = ctx(&user, &store, &prompt);

        let altered = Plugin::alter(
            "rendered",
            Plugin::empty("template"),
            Transform::replace("NAME", Plugin::empty("name")),
        );
        assert_eq!(altered.resolve_input(&ctx), Some("user: alice".to_string()));
    }

    #[test]
    fn url_parser_components() {
        let user = User::default();
        let mut store = PluginStore::default();
        store.set(
            "redirect",
            "https://app.example.com:8443/cb?code=XYZ&state=1#frag",
        );
        let prompt = no_prompt();
        let ctx = ctx(&user, &store, &prompt);

        let source = || Plugin::empty("redirect");
        let cases = [
            (UrlComponent::Scheme, "https"),
            (UrlComponent::Host, "app.example.com:8443"),
            (UrlComponent::Path, "/cb"),
            (UrlComponent::Query("code".to_string()), "XYZ"),
            (UrlComponent::Fragment, "frag"),
        ];
        for (component, expected) in cases {
            let plugin = Plugin::url_parser("part", source(), component);
            assert_eq!(plugin.resolve_input(&ctx), Some(expected.to_string()));
        }
    }

    #[test]
    fn cookie_and_header_extract_last_wins() {
        let response = ResponseSnapshot::new(
            200,
            vec![
                ("set-cookie".to_string(), "sid=first; Path=/".to_string()),
                ("set-cookie".to_string(), "sid=second; Path=/".to_string()),
                ("x-token".to_string(), "one".to_string()),
                ("x-token".to_string(), "two".to_string()),
            ],
            String::new(),
        );
        let store = PluginStore::default();
        assert_eq!(
            Plugin::cookie("sid").extract_output(&response, &store),
            Some("second".to_string())
        );
        assert_eq!(
            Plugin::header("x-token").extract_output(&response, &store),
            Some("two".to_string())
        );
    }
}
