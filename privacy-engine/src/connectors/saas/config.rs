//! SaaS connector configuration and request templating.

use crate::errors::ConnectorError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

fn default_timeout_seconds() -> u64 {
    30
}

fn default_completed_value() -> String {
    "complete".to_string()
}

fn default_failed_value() -> String {
    "failed".to_string()
}

/// Connection settings for one SaaS API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaasConfig {
    /// Base URL, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Authentication.
    #[serde(default)]
    pub auth: SaasAuth,
    /// Static values available to every template.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Endpoints by collection name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
    /// Consent propagation request.
    #[serde(default)]
    pub consent: Option<SaasRequest>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl SaasConfig {
    /// Creates a config with no endpoints.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: SaasAuth::None,
            params: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            consent: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// Sets authentication.
    #[must_use]
    pub fn with_auth(mut self, auth: SaasAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Adds a static template value.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds an endpoint for a collection.
    #[must_use]
    pub fn with_endpoint(mut self, collection: impl Into<String>, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(collection.into(), endpoint);
        self
    }

    /// Sets the consent request.
    #[must_use]
    pub fn with_consent(mut self, request: SaasRequest) -> Self {
        self.consent = Some(request);
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// SaaS authentication. `Debug` never prints credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SaasAuth {
    /// No authentication.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// The token.
        token: String,
    },
    /// HTTP basic auth.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
}

impl fmt::Debug for SaasAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer { .. } => f.write_str("Bearer { token: <redacted> }"),
            Self::Basic { username, .. } => write!(f, "Basic {{ username: {username:?}, password: <redacted> }}"),
        }
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET.
    #[default]
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

/// One templated HTTP request.
///
/// `<name>` placeholders in the path, query values and body strings are
/// filled from static params, query values, row fields or the async job id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaasRequest {
    /// Method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Path appended to the base URL.
    pub path: String,
    /// Query parameters.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// JSON body.
    #[serde(default)]
    pub body: Option<Value>,
    /// Dotted path to the rows in the response.
    #[serde(default)]
    pub data_path: Option<String>,
}

impl SaasRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Sets the body template.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the rows location in the response.
    #[must_use]
    pub fn with_data_path(mut self, path: impl Into<String>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Placeholder names used anywhere in the request.
    #[must_use]
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        scan(&self.path, &mut names);
        self.query.values().for_each(|v| scan(v, &mut names));
        if let Some(body) = &self.body {
            scan_value(body, &mut names);
        }
        names
    }
}

/// Endpoints for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Synchronous read.
    #[serde(default)]
    pub read: Option<SaasRequest>,
    /// Per-row update.
    #[serde(default)]
    pub update: Option<SaasRequest>,
    /// Submit-then-poll read.
    #[serde(default)]
    pub async_read: Option<AsyncReadConfig>,
}

/// Requests making up an async read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncReadConfig {
    /// Starts the job.
    pub submit: SaasRequest,
    /// Reports job status; may use `<job_id>`.
    pub status: SaasRequest,
    /// Fetches the finished rows; may use `<job_id>`.
    pub result: SaasRequest,
    /// Dotted path to the job id in the submit response.
    pub job_id_path: String,
    /// Dotted path to the status in the status response.
    pub status_path: String,
    /// Status value meaning the job finished.
    #[serde(default = "default_completed_value")]
    pub completed_value: String,
    /// Status value meaning the job failed.
    #[serde(default = "default_failed_value")]
    pub failed_value: String,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([A-Za-z0-9_.]+)>").expect("placeholder pattern is valid"))
}

fn scan(template: &str, names: &mut BTreeSet<String>) {
    for caps in placeholder_regex().captures_iter(template) {
        names.insert(caps[1].to_string());
    }
}

fn scan_value(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => scan(s, names),
        Value::Array(items) => items.iter().for_each(|v| scan_value(v, names)),
        Value::Object(map) => map.values().for_each(|v| scan_value(v, names)),
        _ => {}
    }
}

/// Template values.
pub type Params = BTreeMap<String, Value>;

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fills `<name>` placeholders in a string.
pub fn render(template: &str, params: &Params) -> Result<String, ConnectorError> {
    let mut missing = None;
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures<'_>| {
        params.get(&caps[1]).map_or_else(
            || {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            },
            display,
        )
    });
    match missing {
        Some(name) => Err(ConnectorError::permanent(format!("missing template param '{name}'"))),
        None => Ok(rendered.into_owned()),
    }
}

/// Fills placeholders in a JSON body. A string that is exactly one
/// placeholder takes the param's JSON value, keeping its type.
pub fn render_value(template: &Value, params: &Params) -> Result<Value, ConnectorError> {
    match template {
        Value::String(s) => {
            if let Some(caps) = placeholder_regex().captures(s) {
                if caps[0].len() == s.len() {
                    return params
                        .get(&caps[1])
                        .cloned()
                        .ok_or_else(|| ConnectorError::permanent(format!("missing template param '{}'", &caps[1])));
                }
            }
            render(s, params).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, params))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| render_value(v, params).map(|rendered| (k.clone(), rendered)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Follows a dotted path through a JSON value.
pub fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|p| !p.is_empty())
        .try_fold(value, |current, part| match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
