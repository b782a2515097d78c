use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Certificate, Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::EngineSettings;
use crate::core::engine::EngineApi;
use crate::core::types::{AffinityLabel, Entity, EntityKind, Link, ObjectRef, SearchQuery};
use crate::errors::{log_fault, EngineError, EngineResult, LabelError, LabelResult};

// How we hand credentials to the SSO service
#[derive(Debug, Clone)]
enum Credentials {
    Token(String),
    Password { username: String, password: String },
}

/// Session against the engine's v4 REST API.
pub struct RestEngine {
    client: Client,
    api: Url,
    token: String,
    // true when connect() logged in with a password; close() then revokes the token
    owns_token: bool,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct Fault {
    reason: Option<String>,
    detail: Option<String>,
}

#[derive(Deserialize)]
struct ClusterRecord {
    name: String,
}

impl RestEngine {
    /// Checks the connection parameters, then logs in.
    ///
    /// Missing parameters surface as `ClientUnavailable` before anything
    /// touches the network.
    pub async fn connect(settings: &EngineSettings) -> LabelResult<Self> {
        let credentials = credentials(settings)?;
        let api = api_root(&settings.url)?;
        let client = build_client(settings).await?;

        let (token, owns_token) = match credentials {
            Credentials::Token(token) => (token, false),
            Credentials::Password { username, password } => {
                (request_token(&client, &api, &username, &password).await?, true)
            }
        };

        info!("Connected to engine at {}", api);
        Ok(Self {
            client,
            api,
            token,
            owns_token,
        })
    }

    fn url(&self, path: &str) -> EngineResult<Url> {
        resolve(&self.api, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> EngineResult<T> {
        let url = self.url(path)?;
        debug!("GET {}", url);
        let response = self.client.get(url).bearer_auth(&self.token).send().await?;
        decode(checked(response).await?).await
    }

    async fn get_collection<T: DeserializeOwned>(
        &self,
        path: &str,
        element: &str,
        search: Option<&str>,
    ) -> EngineResult<Vec<T>> {
        let url = self.url(path)?;
        debug!(search, "GET {}", url);
        let mut request = self.client.get(url).bearer_auth(&self.token);
        if let Some(search) = search {
            request = request.query(&[("search", search)]);
        }
        let body: Value = decode(checked(request.send().await?).await?).await?;
        collection(body, element)
    }

    async fn post(&self, path: &str, body: &Value) -> EngineResult<Response> {
        let url = self.url(path)?;
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        checked(response).await
    }

    async fn delete(&self, path: &str) -> EngineResult<()> {
        let url = self.url(path)?;
        debug!("DELETE {}", url);
        let response = self.client.delete(url).bearer_auth(&self.token).send().await?;
        checked(response).await?;
        Ok(())
    }
}

#[async_trait]
impl EngineApi for RestEngine {
    async fn list_affinity_labels(&self) -> EngineResult<Vec<AffinityLabel>> {
        self.get_collection("affinitylabels", "affinity_label", None).await
    }

    async fn get_affinity_label(&self, id: &str) -> EngineResult<AffinityLabel> {
        self.get(&format!("affinitylabels/{id}")).await
    }

    async fn add_affinity_label(&self, name: &str) -> EngineResult<AffinityLabel> {
        let response = self.post("affinitylabels", &json!({ "name": name })).await?;
        decode(response).await
    }

    async fn remove_affinity_label(&self, id: &str) -> EngineResult<()> {
        self.delete(&format!("affinitylabels/{id}")).await
    }

    async fn list_label_members(&self, label_id: &str, kind: EntityKind) -> EngineResult<Vec<Link>> {
        let path = format!("affinitylabels/{label_id}/{}", kind.collection());
        self.get_collection(&path, kind.element(), None).await
    }

    async fn get_entity(&self, kind: EntityKind, id: &str) -> EngineResult<Entity> {
        self.get(&format!("{}/{id}", kind.collection())).await
    }

    async fn get_cluster_name(&self, cluster: &Link) -> EngineResult<String> {
        let path = match &cluster.href {
            Some(href) => href.clone(),
            None => format!("clusters/{}", cluster.id),
        };
        let record: ClusterRecord = self.get(&path).await?;
        Ok(record.name)
    }

    async fn search_entities(&self, kind: EntityKind, query: &SearchQuery) -> EngineResult<Vec<Entity>> {
        self.get_collection(kind.collection(), kind.element(), Some(&query.expression()))
            .await
    }

    async fn add_label_member(&self, label_id: &str, member: &ObjectRef) -> EngineResult<()> {
        let path = format!("affinitylabels/{label_id}/{}", member.kind().collection());
        self.post(&path, &member.to_body()).await?;
        Ok(())
    }

    async fn remove_label_member(&self, label_id: &str, kind: EntityKind, entity_id: &str) -> EngineResult<()> {
        self.delete(&format!(
            "affinitylabels/{label_id}/{}/{entity_id}",
            kind.collection()
        ))
        .await
    }

    async fn close(&self) -> EngineResult<()> {
        if !self.owns_token {
            debug!("Releasing engine session, caller supplied token kept");
            return Ok(());
        }

        let url = sso_url(&self.api, "revoke")?;
        let response = self
            .client
            .post(url)
            .form(&[("scope", ""), ("token", self.token.as_str())])
            .send()
            .await?;
        checked(response).await?;
        info!("Logged out of engine");
        Ok(())
    }
}

fn credentials(settings: &EngineSettings) -> LabelResult<Credentials> {
    if settings.url.trim().is_empty() {
        return Err(LabelError::unavailable(
            "engine url is not set (auth.url, engine.url or OVIRT_URL)",
        ));
    }
    if let Some(token) = settings.token.as_ref().filter(|t| !t.is_empty()) {
        return Ok(Credentials::Token(token.clone()));
    }
    match (&settings.username, &settings.password) {
        (Some(username), Some(password)) => Ok(Credentials::Password {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => Err(LabelError::unavailable(
            "either a token or both username and password are required",
        )),
    }
}

/// Normalizes the configured API url so relative paths join under it.
fn api_root(raw: &str) -> LabelResult<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| LabelError::unavailable(format!("invalid engine url {raw}: {e}")))
}

// Absolute hrefs (/ovirt-engine/api/...) replace the path, relative ones append.
fn resolve(api: &Url, path: &str) -> EngineResult<Url> {
    api.join(path).map_err(|e| EngineError::Decode {
        message: format!("cannot build url from {path}: {e}"),
    })
}

/// `https://host/ovirt-engine/api/` -> `https://host/ovirt-engine/sso/oauth/<endpoint>`
fn sso_url(api: &Url, endpoint: &str) -> EngineResult<Url> {
    let base = api.as_str().trim_end_matches('/');
    let base = base.strip_suffix("/api").unwrap_or(base);
    Url::parse(&format!("{base}/sso/oauth/{endpoint}")).map_err(|e| EngineError::Decode {
        message: format!("cannot build sso url: {e}"),
    })
}

async fn build_client(settings: &EngineSettings) -> LabelResult<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert("Version", HeaderValue::from_static("4"));

    let mut builder = Client::builder()
        .default_headers(headers)
        .danger_accept_invalid_certs(settings.insecure);

    if settings.timeout_seconds > 0 {
        builder = builder.timeout(Duration::from_secs(settings.timeout_seconds));
    }

    if let Some(path) = &settings.ca_file {
        let pem = tokio::fs::read(path).await.map_err(|e| {
            LabelError::unavailable(format!("cannot read CA file {}: {e}", path.display()))
        })?;
        let cert = Certificate::from_pem(&pem).map_err(EngineError::from)?;
        builder = builder.add_root_certificate(cert);
    }

    Ok(builder.build().map_err(EngineError::from)?)
}

async fn request_token(client: &Client, api: &Url, username: &str, password: &str) -> EngineResult<String> {
    let url = sso_url(api, "token")?;
    debug!(username, "Requesting SSO token");
    let response = client
        .post(url)
        .form(&[
            ("grant_type", "password"),
            ("scope", "ovirt-app-api"),
            ("username", username),
            ("password", password),
        ])
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    match serde_json::from_str::<TokenResponse>(&text) {
        Ok(TokenResponse {
            access_token: Some(token),
            ..
        }) if status.is_success() => Ok(token),
        Ok(TokenResponse {
            error: Some(code),
            error_description,
            ..
        }) => {
            let message = error_description.unwrap_or(code);
            error!(username, "SSO login failed: {}", message);
            Err(EngineError::Auth { message })
        }
        _ if !status.is_success() => {
            let err = fault_from(status.as_u16(), status.canonical_reason(), &text);
            error!(username, "SSO endpoint answered {}", err);
            Err(err)
        }
        _ => Err(EngineError::Auth {
            message: "no access token in SSO response".to_string(),
        }),
    }
}

async fn checked(response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let err = fault_from(status.as_u16(), status.canonical_reason(), &text);
    if let EngineError::Fault { status, reason, .. } = &err {
        log_fault(*status, reason);
    }
    Err(err)
}

fn fault_from(status: u16, canonical: Option<&str>, body: &str) -> EngineError {
    let body = body.trim();
    let (reason, detail) = match serde_json::from_str::<Fault>(body) {
        Ok(fault) => (fault.reason, fault.detail),
        // proxies in front of the engine answer in plain text
        Err(_) if !body.is_empty() => (None, Some(body.to_string())),
        Err(_) => (None, None),
    };
    EngineError::Fault {
        status,
        reason: reason
            .or_else(|| canonical.map(str::to_string))
            .unwrap_or_else(|| "Unknown fault".to_string()),
        detail,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> EngineResult<T> {
    let body: Value = response.json().await?;
    serde_json::from_value(body).map_err(|e| EngineError::Decode {
        message: e.to_string(),
    })
}

/// Unwraps `{"<element>": [...]}`; the engine drops the key entirely when empty.
fn collection<T: DeserializeOwned>(mut body: Value, element: &str) -> EngineResult<Vec<T>> {
    match body.get_mut(element).map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => serde_json::from_value(items).map_err(|e| EngineError::Decode {
            message: format!("{element} collection: {e}"),
        }),
    }
}
