//! User records carrying the credentials and per-user data for a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One user record: an ordered mapping of field names to string values.
///
/// Every record is expected to carry at least `username` and `password`;
/// arbitrary extra fields (API keys, nicknames, tenant ids) are allowed and
/// are resolved by [`Plugin::variable`](crate::Plugin::variable) lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    fields: BTreeMap<String, String>,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("username".to_string(), username.into());
        fields.insert("password".to_string(), password.into());
        Self { fields }
    }

    /// Adds an extra field to the record.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn username(&self) -> &str {
        self.field("username").unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.field("password").unwrap_or_default()
    }
}
