//! SaaS HTTP connector.
//!
//! Each collection maps to an [`EndpointConfig`] describing templated
//! read, update and async-read requests. Responses are JSON; rows are found
//! at the request's `data_path`.
//!
//! Error messages name the method and the path *template*, never the
//! filled-in URL or credentials, so identity values and tokens stay out of
//! task error records.

mod config;

pub use config::{
    extract, render, render_value, AsyncReadConfig, EndpointConfig, HttpMethod, Params, SaasAuth, SaasConfig,
    SaasRequest,
};

use super::{AsyncHandle, Connector, ConnectorCapabilities, ConsentPreference, PollOutcome, QueryConditions, RowUpdate};
use crate::core::{IdentitySeeds, Row};
use crate::errors::ConnectorError;
use crate::graph::TraversalNode;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Connector for HTTP APIs described by a [`SaasConfig`].
#[derive(Debug, Clone)]
pub struct SaasConnector {
    config: SaasConfig,
    client: Client,
}

impl SaasConnector {
    /// Creates a connector and its HTTP client.
    pub fn new(config: SaasConfig) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ConnectorError::permanent(format!("failed to create HTTP client: {}", e.without_url())))?;
        Ok(Self { config, client })
    }

    /// The connector configuration.
    #[must_use]
    pub fn config(&self) -> &SaasConfig {
        &self.config
    }

    fn endpoint(&self, node: &TraversalNode) -> Result<&EndpointConfig, ConnectorError> {
        self.config
            .endpoints
            .get(&node.address.collection)
            .ok_or_else(|| ConnectorError::permanent(format!("no endpoint configured for '{}'", node.address)))
    }

    fn base_params(&self) -> Params {
        self.config
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }

    /// One param set per combination of condition values the request uses.
    fn bindings(request: &SaasRequest, conditions: &QueryConditions) -> Vec<Params> {
        let used = request.placeholders();
        let mut bindings = vec![Params::new()];
        let mut bound = false;
        for (field, values) in conditions {
            if values.is_empty() || !used.contains(field) {
                continue;
            }
            bound = true;
            bindings = bindings
                .into_iter()
                .flat_map(|binding| {
                    values.iter().map(move |value| {
                        let mut next = binding.clone();
                        next.insert(field.clone(), value.clone());
                        next
                    })
                })
                .collect();
        }
        if bound {
            bindings
        } else {
            Vec::new()
        }
    }

    fn with_base(&self, extra: &Params) -> Params {
        let mut params = self.base_params();
        params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    async fn send(&self, request: &SaasRequest, params: &Params) -> Result<Value, ConnectorError> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        };
        let label = format!("{method} {}", request.path);

        let url = format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            render(&request.path, params)?
        );
        let mut builder = self.client.request(method, url);

        let query = request
            .query
            .iter()
            .map(|(k, v)| render(v, params).map(|rendered| (k.clone(), rendered)))
            .collect::<Result<Vec<_>, _>>()?;
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(&render_value(body, params)?);
        }
        builder = match &self.config.auth {
            SaasAuth::None => builder,
            SaasAuth::Bearer { token } => builder.bearer_auth(token),
            SaasAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
        };

        tracing::debug!(request = %label, "Sending SaaS request");
        let response = builder.send().await.map_err(|e| map_send_error(&label, e))?;
        check_status(&label, response.status())?;

        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::transient(format!("{label}: failed to read body: {}", e.without_url())))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ConnectorError::malformed(format!("{label}: {e}")))
    }
}

fn map_send_error(label: &str, error: reqwest::Error) -> ConnectorError {
    let error = error.without_url();
    if error.is_builder() {
        ConnectorError::permanent(format!("{label}: {error}"))
    } else {
        ConnectorError::transient(format!("{label}: {error}"))
    }
}

fn check_status(label: &str, status: StatusCode) -> Result<(), ConnectorError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{label}: HTTP {}", status.as_u16());
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::transient(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::auth(message),
        s if s.is_server_error() => ConnectorError::transient(message),
        _ => ConnectorError::permanent(message),
    })
}

/// Extracts rows at `data_path` from a response body.
fn rows_from(body: &Value, data_path: Option<&str>) -> Result<Vec<Row>, ConnectorError> {
    let target = match data_path {
        Some(path) => {
            extract(body, path).ok_or_else(|| ConnectorError::malformed(format!("data_path '{path}' not found")))?
        }
        None => body,
    };
    match target {
        Value::Null => Ok(Vec::new()),
        Value::Object(row) => Ok(vec![row.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .cloned()
                    .ok_or_else(|| ConnectorError::malformed("expected an array of objects"))
            })
            .collect(),
        _ => Err(ConnectorError::malformed("expected an object or an array of objects")),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Connector for SaasConnector {
    fn kind(&self) -> &'static str {
        "saas"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        let endpoints = self.config.endpoints.values();
        ConnectorCapabilities {
            query: endpoints.clone().any(|e| e.read.is_some()),
            mutate: endpoints.clone().any(|e| e.update.is_some()),
            async_submit_poll: endpoints.clone().any(|e| e.async_read.is_some()),
            consent: self.config.consent.is_some(),
            manual: false,
        }
    }

    fn uses_async_read(&self, node: &TraversalNode) -> bool {
        self.config
            .endpoints
            .get(&node.address.collection)
            .is_some_and(|e| e.async_read.is_some())
    }

    async fn retrieve(&self, node: &TraversalNode, conditions: &QueryConditions) -> Result<Vec<Row>, ConnectorError> {
        let request = self
            .endpoint(node)?
            .read
            .as_ref()
            .ok_or_else(|| ConnectorError::unsupported("retrieve"))?;

        let mut rows = Vec::new();
        for binding in Self::bindings(request, conditions) {
            let body = self.send(request, &self.with_base(&binding)).await?;
            rows.extend(rows_from(&body, request.data_path.as_deref())?);
        }
        Ok(rows)
    }

    async fn mutate(&self, node: &TraversalNode, updates: &[RowUpdate]) -> Result<usize, ConnectorError> {
        let request = self
            .endpoint(node)?
            .update
            .as_ref()
            .ok_or_else(|| ConnectorError::unsupported("mutate"))?;

        for update in updates {
            let mut params = self.base_params();
            params.extend(update.key.iter().map(|(k, v)| (k.clone(), v.clone())));
            params.extend(update.changes.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.send(request, &params).await?;
        }
        Ok(updates.len())
    }

    async fn submit_async(&self, node: &TraversalNode, conditions: &QueryConditions) -> Result<AsyncHandle, ConnectorError> {
        let async_read = self
            .endpoint(node)?
            .async_read
            .as_ref()
            .ok_or_else(|| ConnectorError::unsupported("submit_async"))?;

        let mut bindings = Self::bindings(&async_read.submit, conditions);
        if bindings.len() > 1 {
            return Err(ConnectorError::permanent(format!(
                "async read for '{}' takes one value per param, got {} combinations",
                node.address,
                bindings.len()
            )));
        }
        let binding = bindings.pop().unwrap_or_default();

        let body = self.send(&async_read.submit, &self.with_base(&binding)).await?;
        let job_id = extract(&body, &async_read.job_id_path)
            .and_then(scalar_string)
            .ok_or_else(|| ConnectorError::malformed(format!("job id not found at '{}'", async_read.job_id_path)))?;

        tracing::info!(collection = %node.address, job_id = %job_id, "Submitted async read");
        let context = Value::Object(binding.into_iter().collect());
        Ok(AsyncHandle::new(job_id).with_context(context))
    }

    async fn poll_async(&self, node: &TraversalNode, handle: &AsyncHandle) -> Result<PollOutcome, ConnectorError> {
        let async_read = self
            .endpoint(node)?
            .async_read
            .as_ref()
            .ok_or_else(|| ConnectorError::unsupported("poll_async"))?;

        let mut params = self.base_params();
        if let Value::Object(context) = &handle.context {
            params.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        params.insert("job_id".to_string(), Value::String(handle.job_id.clone()));

        let body = self.send(&async_read.status, &params).await?;
        let status = extract(&body, &async_read.status_path)
            .and_then(scalar_string)
            .ok_or_else(|| ConnectorError::malformed(format!("job status not found at '{}'", async_read.status_path)))?;

        if status == async_read.completed_value {
            let body = self.send(&async_read.result, &params).await?;
            return rows_from(&body, async_read.result.data_path.as_deref()).map(PollOutcome::Rows);
        }
        if status == async_read.failed_value {
            return Ok(PollOutcome::Failed(format!("job {} reported '{status}'", handle.job_id)));
        }
        Ok(PollOutcome::Pending)
    }

    async fn update_consent(
        &self,
        identity: &IdentitySeeds,
        preferences: &[ConsentPreference],
    ) -> Result<bool, ConnectorError> {
        let request = self
            .config
            .consent
            .as_ref()
            .ok_or_else(|| ConnectorError::unsupported("update_consent"))?;

        let mut params = self.base_params();
        params.extend(identity.iter().map(|(k, v)| (k.clone(), v.clone())));
        params.insert(
            "preferences".to_string(),
            serde_json::to_value(preferences).map_err(|e| ConnectorError::permanent(e.to_string()))?,
        );
        self.send(request, &params).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CollectionConfig, DatasetConfig, FieldConfig, Traversal};
    use crate::testing::{MockHttpServer, MockRoute};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node() -> TraversalNode {
        let dataset = DatasetConfig::new("crm", "crm").with_collection(
            CollectionConfig::new("contacts")
                .with_field(FieldConfig::new("id").primary_key())
                .with_field(FieldConfig::new("email").with_identity("email")),
        );
        let seeds: IdentitySeeds = [("email".to_string(), json!("a@b.c"))].into_iter().collect();
        let traversal = Traversal::build(&[dataset], &seeds).unwrap();
        let node = traversal.nodes().next().unwrap().clone();
        node
    }

    fn conditions() -> QueryConditions {
        [("email".to_string(), vec![json!("a@b.c")])].into_iter().collect()
    }

    fn read_config(base_url: &str) -> SaasConfig {
        SaasConfig::new(base_url)
            .with_auth(SaasAuth::Bearer {
                token: "secret-token".to_string(),
            })
            .with_param("version", "v2")
            .with_endpoint(
                "contacts",
                EndpointConfig {
                    read: Some(
                        SaasRequest::new(HttpMethod::Get, "/<version>/contacts")
                            .with_query("email", "<email>")
                            .with_data_path("data.contacts"),
                    ),
                    update: Some(
                        SaasRequest::new(HttpMethod::Put, "/<version>/contacts/<id>")
                            .with_body(json!({"email": "<email>"})),
                    ),
                    async_read: None,
                },
            )
    }

    #[tokio::test]
    async fn test_retrieve_with_data_path_and_auth() {
        let server = MockHttpServer::start(vec![MockRoute::new("GET", "/v2/contacts")
            .respond(200, json!({"data": {"contacts": [{"id": 1, "email": "a@b.c"}]}}))])
        .await
        .unwrap();
        let connector = SaasConnector::new(read_config(server.base_url())).unwrap();

        let rows = connector.retrieve(&node(), &conditions()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target, "/v2/contacts?email=a%40b.c");
        assert_eq!(requests[0].header("authorization"), Some("Bearer secret-token"));
    }

    #[tokio::test]
    async fn test_one_request_per_value() {
        let server = MockHttpServer::start(vec![
            MockRoute::new("GET", "/v2/contacts").respond(200, json!({"data": {"contacts": [{"id": 1}]}}))
        ])
        .await
        .unwrap();
        let connector = SaasConnector::new(read_config(server.base_url())).unwrap();
        let conditions: QueryConditions = [("email".to_string(), vec![json!("a@b.c"), json!("d@e.f")])]
            .into_iter()
            .collect();

        let rows = connector.retrieve(&node(), &conditions).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(server.count("GET", "/v2/contacts"), 2);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (500, true, "Transient"),
            (429, true, "Transient"),
            (401, false, "Auth"),
            (403, false, "Auth"),
            (404, false, "Permanent"),
        ];
        for (status, retryable, kind) in cases {
            let server = MockHttpServer::start(vec![MockRoute::new("GET", "/v2/contacts").respond(status, json!({}))])
                .await
                .unwrap();
            let connector = SaasConnector::new(read_config(server.base_url())).unwrap();

            let err = connector.retrieve(&node(), &conditions()).await.unwrap_err();
            assert_eq!(err.is_retryable(), retryable, "status {status}");
            assert_eq!(format!("{:?}", err.kind()), kind, "status {status}");
            assert!(!err.to_string().contains("secret-token"));
            assert!(!err.to_string().contains("a@b.c"));
        }
    }

    #[tokio::test]
    async fn test_unparsable_body_is_malformed() {
        let server = MockHttpServer::start(vec![MockRoute::new("GET", "/v2/contacts").respond_raw(200, "<html>")])
            .await
            .unwrap();
        let connector = SaasConnector::new(read_config(server.base_url())).unwrap();

        let err = connector.retrieve(&node(), &conditions()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let connector = SaasConnector::new(read_config(&format!("http://{address}"))).unwrap();
        let err = connector.retrieve(&node(), &conditions()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_mutate_renders_body() {
        let server = MockHttpServer::start(vec![MockRoute::new("PUT", "/v2/contacts/1").respond(200, json!({}))])
            .await
            .unwrap();
        let connector = SaasConnector::new(read_config(server.base_url())).unwrap();
        let update = RowUpdate {
            key: [("id".to_string(), json!(1))].into_iter().collect(),
            changes: [("email".to_string(), Value::Null)].into_iter().collect(),
        };

        let updated = connector.mutate(&node(), &[update]).await.unwrap();
        assert_eq!(updated, 1);
        let body: Value = serde_json::from_str(&server.requests()[0].body).unwrap();
        assert_eq!(body, json!({"email": null}));
    }

    #[tokio::test]
    async fn test_async_submit_and_poll() {
        let server = MockHttpServer::start(vec![
            MockRoute::new("POST", "/exports").respond(202, json!({"job": {"id": 42}})),
            MockRoute::new("GET", "/exports/42")
                .respond(200, json!({"state": "running"}))
                .respond(200, json!({"state": "done"})),
            MockRoute::new("GET", "/exports/42/rows").respond(200, json!([{"id": 1, "email": "a@b.c"}])),
        ])
        .await
        .unwrap();
        let config = SaasConfig::new(server.base_url()).with_endpoint(
            "contacts",
            EndpointConfig {
                async_read: Some(AsyncReadConfig {
                    submit: SaasRequest::new(HttpMethod::Post, "/exports").with_body(json!({"email": "<email>"})),
                    status: SaasRequest::new(HttpMethod::Get, "/exports/<job_id>"),
                    result: SaasRequest::new(HttpMethod::Get, "/exports/<job_id>/rows"),
                    job_id_path: "job.id".to_string(),
                    status_path: "state".to_string(),
                    completed_value: "done".to_string(),
                    failed_value: "failed".to_string(),
                }),
                ..EndpointConfig::default()
            },
        );
        let connector = SaasConnector::new(config).unwrap();
        let node = node();
        assert!(connector.uses_async_read(&node));

        let handle = connector.submit_async(&node, &conditions()).await.unwrap();
        assert_eq!(handle.job_id, "42");
        assert_eq!(handle.context, json!({"email": "a@b.c"}));

        assert_eq!(connector.poll_async(&node, &handle).await.unwrap(), PollOutcome::Pending);
        match connector.poll_async(&node, &handle).await.unwrap() {
            PollOutcome::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(server.count("POST", "/exports"), 1);
    }

    #[tokio::test]
    async fn test_consent_request() {
        let server = MockHttpServer::start(vec![MockRoute::new("POST", "/consent").respond(200, json!({"ok": true}))])
            .await
            .unwrap();
        let config = SaasConfig::new(server.base_url()).with_consent(
            SaasRequest::new(HttpMethod::Post, "/consent")
                .with_body(json!({"email": "<email>", "preferences": "<preferences>"})),
        );
        let connector = SaasConnector::new(config).unwrap();
        assert!(connector.capabilities().consent);

        let identity: IdentitySeeds = [("email".to_string(), json!("a@b.c"))].into_iter().collect();
        let accepted = connector
            .update_consent(
                &identity,
                &[ConsentPreference {
                    notice: "marketing".to_string(),
                    opt_in: false,
                }],
            )
            .await
            .unwrap();
        assert!(accepted);

        let body: Value = serde_json::from_str(&server.requests()[0].body).unwrap();
        assert_eq!(
            body,
            json!({"email": "a@b.c", "preferences": [{"notice": "marketing", "opt_in": false}]})
        );
    }

    #[test]
    fn test_rows_from_shapes() {
        assert_eq!(rows_from(&json!({"a": 1}), None).unwrap().len(), 1);
        assert!(rows_from(&Value::Null, None).unwrap().is_empty());
        assert!(rows_from(&json!([1, 2]), None).is_err());
        assert!(rows_from(&json!({"x": []}), Some("y")).is_err());
    }
}
