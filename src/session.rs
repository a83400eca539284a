//! Per-run session state: cookie jar, plugin-value store, active user, and
//! the HTTP client. Every mutation of an authentication run lands here; the
//! flows and the graph stay read-only.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::http::{build_client, CookieJar, CookieRecord, ResponseSnapshot, TransportConfig};
use crate::plugins::{stdin_prompt, Plugin, PromptFn, ResolveCtx};
use crate::request::{PreparedBody, PreparedRequest};
use crate::user::User;

const COOKIES_FILE: &str = "cookies.json";
const VALUES_FILE: &str = "values.json";

/// Plugin identity → last known value, shared by all flows of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginStore {
    values: BTreeMap<String, String>,
}

impl PluginStore {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Mutable state owned by exactly one authentication run.
pub struct Session {
    jar: Arc<CookieJar>,
    store: PluginStore,
    user: User,
    http: reqwest::Client,
    prompt: PromptFn,
}

impl Session {
    pub fn new(user: User, transport: TransportConfig) -> Result<Self> {
        let jar = Arc::new(CookieJar::default());
        let http = build_client(&transport, jar.clone())?;
        Ok(Self {
            jar,
            store: PluginStore::default(),
            user,
            http,
            prompt: stdin_prompt(),
        })
    }

    /// Replaces the terminal prompt used by prompt plugins.
    pub fn with_prompt(mut self, prompt: PromptFn) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn set_user(&mut self, user: User) {
        self.user = user;
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PluginStore {
        &mut self.store
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    pub(crate) fn resolve_ctx(&self) -> ResolveCtx<'_> {
        ResolveCtx {
            user: &self.user,
            store: &self.store,
            prompt: &self.prompt,
        }
    }

    /// Folds values resolved during request preparation back into the store.
    pub(crate) fn absorb_resolved(&mut self, resolved: Vec<(String, String)>) {
        for (name, value) in resolved {
            self.store.set(name, value);
        }
    }

    /// Performs the HTTP round-trip for a prepared request.
    ///
    /// Request-level cookies are staged into the jar for the target host so
    /// the cookie middleware sends them alongside the jar's own matches.
    /// Set-Cookie headers of the final response are merged into the jar even
    /// when the transport was injected without our cookie middleware.
    pub(crate) async fn send(&mut self, prepared: PreparedRequest) -> Result<ResponseSnapshot> {
        for (name, value) in &prepared.cookies {
            self.jar.insert(CookieRecord {
                name: name.clone(),
                value: value.clone(),
                domain: prepared.url.host_str().unwrap_or_default().to_string(),
                path: "/".to_string(),
                secure: false,
                host_only: true,
            });
        }

        let mut builder = self
            .http
            .request(prepared.method.clone(), prepared.url.clone());
        for (name, value) in &prepared.headers {
            builder = builder.header(name, value);
        }
        builder = match prepared.body {
            PreparedBody::None => builder,
            PreparedBody::Form(fields) => builder.form(&fields),
            PreparedBody::Raw(raw) => builder.body(raw),
            PreparedBody::Json(value) => builder.json(&value),
        };

        debug!(method = %prepared.method, url = %prepared.url, "sending request");
        let response = builder.send().await?;
        let final_url = response.url().clone();
        let snapshot = ResponseSnapshot::read(response).await?;
        for raw in snapshot.raw_set_cookies() {
            self.jar.merge_set_cookie(raw, &final_url);
        }
        debug!(status = snapshot.status(), "received response");
        Ok(snapshot)
    }

    /// Fills the declared output plugins from the response, in order.
    ///
    /// Response-extractable outputs read the response; derived outputs
    /// resolve from values already in the store (including ones bound
    /// earlier in the same list). A failed extraction leaves the previous
    /// store value intact.
    pub(crate) fn bind_outputs(&mut self, outputs: &[Plugin], response: &ResponseSnapshot) {
        for output in outputs {
            let value = if output.needs_response() {
                output.extract_output(response, &self.store)
            } else if output.depends_on_other_plugins() {
                let ctx = ResolveCtx {
                    user: &self.user,
                    store: &self.store,
                    prompt: &self.prompt,
                };
                output.resolve_input(&ctx)
            } else {
                None
            };
            match value {
                Some(value) => {
                    debug!(output = %output.name(), %value, "found output");
                    self.store.set(output.name(), value);
                }
                None => warn!("Couldn't extract output: {}", output.name()),
            }
        }
    }

    /// Writes the cookie jar and the plugin-value store into `dir`.
    ///
    /// The encoding is deterministic: records are sorted, so
    /// dump → load → dump produces byte-equal files.
    pub fn dump(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut cookies = serde_json::to_string_pretty(&self.jar.records())?;
        cookies.push('\n');
        fs::write(dir.join(COOKIES_FILE), cookies)?;
        let mut values = serde_json::to_string_pretty(&self.store)?;
        values.push('\n');
        fs::write(dir.join(VALUES_FILE), values)?;
        debug!(dir = %dir.display(), "session state saved");
        Ok(())
    }

    /// Restores the cookie jar and the plugin-value store from `dir`.
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let records: Vec<CookieRecord> =
            serde_json::from_str(&fs::read_to_string(dir.join(COOKIES_FILE))?)?;
        self.jar.replace(records);
        self.store = serde_json::from_str(&fs::read_to_string(dir.join(VALUES_FILE))?)?;
        debug!(dir = %dir.display(), "session state restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_keeps_last_value_per_name() {
        let mut store = PluginStore::default();
        store.set("sid", "one");
        store.set("sid", "two");
        assert_eq!(store.get("sid"), Some("two"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.remove("sid"), Some("two".to_string()));
        assert!(store.is_empty());
    }

    #[test]
    fn binding_same_outputs_twice_is_idempotent() {
        let mut session = Session::new(User::default(), TransportConfig::default()).unwrap();
        let outputs = vec![
            Plugin::cookie("sid"),
            Plugin::regex("token", "token=(\\w+)").unwrap(),
        ];
        let response = ResponseSnapshot::new(
            200,
            vec![("set-cookie".to_string(), "sid=abc; Path=/".to_string())],
            "token=xyz".to_string(),
        );

        session.bind_outputs(&outputs, &response);
        let first = session.store().clone();
        session.bind_outputs(&outputs, &response);
        assert_eq!(session.store(), &first);
        assert_eq!(session.store().get("sid"), Some("abc"));
        assert_eq!(session.store().get("token"), Some("xyz"));
    }

    #[test]
    fn failed_extraction_leaves_previous_value() {
        let mut session = Session::new(User::default(), TransportConfig::default()).unwrap();
        session.store_mut().set("token", "earlier");
        let outputs = vec![Plugin::regex("token", "token=(\\w+)").unwrap()];
        let response = ResponseSnapshot::new(200, vec![], "no match here".to_string());
        session.bind_outputs(&outputs, &response);
        assert_eq!(session.store().get("token"), Some("earlier"));
    }

    #[test]
    fn derived_output_binds_after_its_source() {
        let mut session = Session::new(User::default(), TransportConfig::default()).unwrap();
        let outputs = vec![
            Plugin::regex("token", "token=(\\w+)").unwrap(),
            Plugin::alter(
                "prefixed",
                Plugin::empty("token"),
                crate::plugins::Transform::prepend("t-"),
            ),
        ];
        let response = ResponseSnapshot::new(200, vec![], "token=xyz".to_string());
        session.bind_outputs(&outputs, &response);
        assert_eq!(session.store().get("prefixed"), Some("t-xyz"));
    }

    #[test]
    fn dump_load_dump_is_byte_equal() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");

        let mut session = Session::new(User::default(), TransportConfig::default()).unwrap();
        session.store_mut().set("sid", "abc");
        session.store_mut().set("token", "xyz");
        session.cookies().insert(CookieRecord {
            name: "sid".to_string(),
            value: "abc".to_string(),
            domain: "example.com".to_string(),
            path: "/".to_string(),
            secure: true,
            host_only: true,
        });

        session.dump(&first).unwrap();
        let mut restored = Session::new(User::default(), TransportConfig::default()).unwrap();
        restored.load(&first).unwrap();
        restored.dump(&second).unwrap();

        for file in [COOKIES_FILE, VALUES_FILE] {
            assert_eq!(
                fs::read(first.join(file)).unwrap(),
                fs::read(second.join(file)).unwrap(),
                "{file} must round-trip byte-equal"
            );
        }
        assert_eq!(restored.store().get("sid"), Some("abc"));
        assert_eq!(restored.cookies().value("sid"), Some("abc".to_string()));
    }
}
