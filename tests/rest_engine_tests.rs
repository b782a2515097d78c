// REST Engine Test Suite - a small axum app speaks just enough of the oVirt v4 API

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use ovirt_affinity_labels::config::EngineSettings;
use ovirt_affinity_labels::core::{EngineApi, RestEngine};
use ovirt_affinity_labels::errors::{EngineError, ErrorContext, LabelError};
use ovirt_affinity_labels::module::{run_module, ModuleParams};
use ovirt_affinity_labels::reconciler::Reconciler;

const GIVEN_TOKEN: &str = "tok-given";
const ISSUED_TOKEN: &str = "tok-issued";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
enum Sso {
    #[default]
    Grant,
    Deny,
    // a proxy answering for an engine without SSO
    Missing,
}

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    search: Option<String>,
    authorization: Option<String>,
    body: String,
}

#[derive(Debug, Default)]
struct StubState {
    // id -> name
    clusters: BTreeMap<String, String>,
    // id -> (name, cluster id)
    vms: BTreeMap<String, (String, String)>,
    // id -> (name, vm ids)
    labels: BTreeMap<String, (String, Vec<String>)>,
    requests: Vec<Recorded>,
    reject_members: bool,
    sso: Sso,
}

#[derive(Clone, Default)]
struct StubEngine {
    state: Arc<Mutex<StubState>>,
}

impl StubEngine {
    // mylabel in mycluster carrying vm2 and vm3, plus vm1 waiting to be labelled
    fn example() -> Self {
        let stub = StubEngine::default();
        {
            let mut state = stub.state.lock().unwrap();
            state.clusters.insert("c-1".into(), "mycluster".into());
            state.clusters.insert("c-2".into(), "othercluster".into());
            for (id, name, cluster) in [
                ("v-1", "vm1", "c-1"),
                ("v-2", "vm2", "c-1"),
                ("v-3", "vm3", "c-1"),
                ("v-9", "vm1", "c-2"),
            ] {
                state.vms.insert(id.into(), (name.into(), cluster.into()));
            }
            state
                .labels
                .insert("l-1".into(), ("mylabel".into(), vec!["v-2".into(), "v-3".into()]));
        }
        stub
    }

    fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    fn members(&self, label: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids = state.labels.get(label).map(|(_, ids)| ids.clone()).unwrap_or_default();
        ids.sort();
        ids
    }

    fn set_sso(&self, sso: Sso) {
        self.state.lock().unwrap().sso = sso;
    }

    fn reject_members(&self) {
        self.state.lock().unwrap().reject_members = true;
    }
}

fn fault(status: StatusCode, reason: &str, detail: &str) -> Response {
    (status, Json(json!({ "reason": reason, "detail": detail }))).into_response()
}

fn vm_json(id: &str, name: &str, cluster: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "href": format!("/ovirt-engine/api/vms/{id}"),
        "cluster": { "id": cluster, "href": format!("/ovirt-engine/api/clusters/{cluster}") }
    })
}

fn label_json(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name, "href": format!("/ovirt-engine/api/affinitylabels/{id}"), "read_only": false })
}

// "name=vm1 and cluster=mycluster" -> [("name", "vm1"), ("cluster", "mycluster")]
fn search_terms(search: &str) -> HashMap<&str, &str> {
    search
        .split(" and ")
        .filter_map(|term| term.split_once('='))
        .collect()
}

async fn handle(
    State(stub): State<StubEngine>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let mut state = stub.state.lock().unwrap();
    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.requests.push(Recorded {
        method: method.clone(),
        path: uri.path().to_string(),
        search: query.get("search").cloned(),
        authorization: authorization.clone(),
        body: body.clone(),
    });

    let path = uri.path().trim_start_matches("/ovirt-engine/");
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method.as_str(), segments.as_slice()) {
        ("POST", ["sso", "oauth", "token"]) => match state.sso {
            Sso::Grant if body.contains("password=secret") => {
                Json(json!({ "access_token": ISSUED_TOKEN, "token_type": "bearer" })).into_response()
            }
            Sso::Missing => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            _ => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "access_denied",
                    "error_description": "Cannot authenticate user 'admin@internal'"
                })),
            )
                .into_response(),
        },
        ("POST", ["sso", "oauth", "revoke"]) => Json(json!({})).into_response(),
        (_, ["api", rest @ ..]) => {
            let allowed = [format!("Bearer {GIVEN_TOKEN}"), format!("Bearer {ISSUED_TOKEN}")];
            if !authorization.is_some_and(|a| allowed.contains(&a)) {
                return fault(StatusCode::UNAUTHORIZED, "Unauthorized", "missing or stale token");
            }
            api(&mut state, method.as_str(), rest, query.get("search"), &body)
        }
        _ => fault(StatusCode::NOT_FOUND, "Not Found", path),
    }
}

fn api(state: &mut StubState, method: &str, path: &[&str], search: Option<&String>, body: &str) -> Response {
    let missing = || fault(StatusCode::NOT_FOUND, "Not Found", "Entity not found");

    match (method, path) {
        ("GET", ["affinitylabels"]) => {
            let labels: Vec<Value> = state
                .labels
                .iter()
                .map(|(id, (name, _))| label_json(id, name))
                .collect();
            Json(json!({ "affinity_label": labels })).into_response()
        }
        ("POST", ["affinitylabels"]) => {
            let Some(name) = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["name"].as_str().map(str::to_string))
            else {
                return fault(StatusCode::BAD_REQUEST, "Incomplete parameters", "name");
            };
            let id = format!("l-{}", state.labels.len() + 1);
            state.labels.insert(id.clone(), (name.clone(), Vec::new()));
            (StatusCode::CREATED, Json(label_json(&id, &name))).into_response()
        }
        ("GET", ["affinitylabels", id]) => match state.labels.get(*id) {
            Some((name, _)) => Json(label_json(id, name)).into_response(),
            None => missing(),
        },
        ("DELETE", ["affinitylabels", id]) => match state.labels.remove(*id) {
            Some(_) => Json(json!({})).into_response(),
            None => missing(),
        },
        ("GET", ["affinitylabels", id, "vms"]) => match state.labels.get(*id) {
            // the engine leaves the key out of an empty collection
            Some((_, ids)) if ids.is_empty() => Json(json!({})).into_response(),
            Some((_, ids)) => {
                let links: Vec<Value> = ids
                    .iter()
                    .map(|vm| json!({ "id": vm, "href": format!("/ovirt-engine/api/vms/{vm}") }))
                    .collect();
                Json(json!({ "vm": links })).into_response()
            }
            None => missing(),
        },
        ("GET", ["affinitylabels", _, "hosts"]) => Json(json!({})).into_response(),
        ("POST", ["affinitylabels", id, "vms"]) => {
            if state.reject_members {
                return fault(StatusCode::CONFLICT, "Operation Failed", "[Cannot edit VM. VM is locked.]");
            }
            let Some(vm) = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["id"].as_str().map(str::to_string))
            else {
                return fault(StatusCode::BAD_REQUEST, "Incomplete parameters", "id");
            };
            match state.labels.get_mut(*id) {
                Some((_, ids)) => {
                    ids.push(vm.clone());
                    (StatusCode::CREATED, Json(json!({ "id": vm }))).into_response()
                }
                None => missing(),
            }
        }
        ("DELETE", ["affinitylabels", id, "vms", vm]) => match state.labels.get_mut(*id) {
            Some((_, ids)) if ids.iter().any(|v| v.as_str() == *vm) => {
                ids.retain(|v| v.as_str() != *vm);
                Json(json!({})).into_response()
            }
            _ => missing(),
        },
        ("GET", ["vms"]) => {
            let terms = search.map(|s| search_terms(s)).unwrap_or_default();
            let found: Vec<Value> = state
                .vms
                .iter()
                .filter(|(_, (name, _))| terms.get("name").map_or(true, |n| *n == name.as_str()))
                .filter(|(_, (_, cluster))| {
                    terms
                        .get("cluster")
                        .map_or(true, |c| state.clusters.get(cluster).is_some_and(|name| name.as_str() == *c))
                })
                .map(|(id, (name, cluster))| vm_json(id, name, cluster))
                .collect();
            Json(json!({ "vm": found })).into_response()
        }
        ("GET", ["vms", id]) => match state.vms.get(*id) {
            Some((name, cluster)) => Json(vm_json(id, name, cluster)).into_response(),
            None => missing(),
        },
        ("GET", ["clusters", id]) => match state.clusters.get(*id) {
            Some(name) => Json(json!({ "id": id, "name": name })).into_response(),
            None => missing(),
        },
        _ => missing(),
    }
}

// serves the stub on an ephemeral port and returns the API root
async fn serve(stub: StubEngine) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().fallback(handle).with_state(stub);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(format!("http://{addr}/ovirt-engine/api"))
}

fn token_settings(url: &str) -> EngineSettings {
    EngineSettings {
        url: url.to_string(),
        token: Some(GIVEN_TOKEN.to_string()),
        timeout_seconds: 10,
        ..Default::default()
    }
}

fn password_settings(url: &str) -> EngineSettings {
    EngineSettings {
        url: url.to_string(),
        username: Some("admin@internal".to_string()),
        password: Some("secret".to_string()),
        timeout_seconds: 10,
        ..Default::default()
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|n| n.to_string()).collect()
}

fn is_mutation(request: &Recorded) -> bool {
    request.method == Method::POST || request.method == Method::DELETE
}

#[tokio::test]
async fn test_reconcile_over_http_searches_adds_and_removes() -> Result<()> {
    let stub = StubEngine::example();
    let url = serve(stub.clone()).await?;
    let engine = RestEngine::connect(&token_settings(&url)).await?;

    let desired = names(&["vm1", "vm2"]);
    let outcome = Reconciler::new(&engine, false)
        .ensure_present("mylabel", Some("mycluster"), Some(&desired), None)
        .await?;

    assert!(outcome.changed);
    assert_eq!(outcome.label.map(|l| l.id), Some("l-1".to_string()));
    // vm1 in othercluster (v-9) must not be picked up
    assert_eq!(stub.members("l-1"), vec!["v-1", "v-2"]);

    let requests = stub.requests();
    assert!(requests.iter().all(|r| r.authorization.as_deref() == Some("Bearer tok-given")));

    let search = requests
        .iter()
        .find(|r| r.method == Method::GET && r.path == "/ovirt-engine/api/vms")
        .expect("vm search issued");
    assert_eq!(search.search.as_deref(), Some("name=vm1 and cluster=mycluster"));

    let mutations: Vec<&Recorded> = requests.iter().filter(|r| is_mutation(r)).collect();
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[0].method, Method::POST);
    assert_eq!(mutations[0].path, "/ovirt-engine/api/affinitylabels/l-1/vms");
    assert_eq!(serde_json::from_str::<Value>(&mutations[0].body)?, json!({ "id": "v-1" }));
    assert_eq!(mutations[1].method, Method::DELETE);
    assert_eq!(mutations[1].path, "/ovirt-engine/api/affinitylabels/l-1/vms/v-3");
    Ok(())
}

#[tokio::test]
async fn test_second_run_over_http_sends_no_mutations() -> Result<()> {
    let stub = StubEngine::example();
    let url = serve(stub.clone()).await?;
    let engine = RestEngine::connect(&token_settings(&url)).await?;
    let reconciler = Reconciler::new(&engine, false);
    let desired = names(&["vm1", "vm2"]);

    reconciler
        .ensure_present("mylabel", Some("mycluster"), Some(&desired), None)
        .await?;
    let before = stub.requests().iter().filter(|r| is_mutation(r)).count();

    let again = reconciler
        .ensure_present("mylabel", Some("mycluster"), Some(&desired), None)
        .await?;

    assert!(!again.changed);
    assert_eq!(stub.requests().iter().filter(|r| is_mutation(r)).count(), before);
    Ok(())
}

#[tokio::test]
async fn test_engine_fault_is_decoded() -> Result<()> {
    let stub = StubEngine::example();
    stub.reject_members();
    let url = serve(stub.clone()).await?;
    let engine = RestEngine::connect(&token_settings(&url)).await?;

    let desired = names(&["vm1", "vm2", "vm3"]);
    let err = Reconciler::new(&engine, false)
        .ensure_present("mylabel", Some("mycluster"), Some(&desired), None)
        .await
        .unwrap_err();

    match err {
        EngineError::Fault { status, reason, detail } => {
            assert_eq!(status, 409);
            assert_eq!(reason, "Operation Failed");
            assert!(detail.unwrap_or_default().contains("VM is locked"));
        }
        other => panic!("expected a fault, got {other:?}"),
    }
    assert_eq!(stub.members("l-1"), vec!["v-2", "v-3"]);
    Ok(())
}

#[tokio::test]
async fn test_missing_label_is_created_and_reported() -> Result<()> {
    let stub = StubEngine::example();
    let url = serve(stub.clone()).await?;
    let engine = RestEngine::connect(&token_settings(&url)).await?;
    let params = ModuleParams::from_json(
        r#"{"name": "newlabel", "cluster": "mycluster", "vms": ["vm3"], "hosts": []}"#,
    )?;

    let result = run_module(&engine, &params, &ErrorContext::new(file!(), "create label")).await;

    assert!(!result.failed, "{:?}", result.msg);
    assert!(result.changed);
    assert_eq!(result.id.as_deref(), Some("l-2"));
    assert_eq!(result.affinity_label.map(|l| l.name), Some("newlabel".to_string()));
    assert_eq!(stub.members("l-2"), vec!["v-3"]);

    let created = stub
        .requests()
        .into_iter()
        .find(|r| r.method == Method::POST && r.path == "/ovirt-engine/api/affinitylabels")
        .expect("label created");
    assert_eq!(serde_json::from_str::<Value>(&created.body)?, json!({ "name": "newlabel" }));
    Ok(())
}

#[tokio::test]
async fn test_password_login_is_revoked_on_close() -> Result<()> {
    let stub = StubEngine::example();
    let url = serve(stub.clone()).await?;
    let engine = RestEngine::connect(&password_settings(&url)).await?;

    let labels = engine.list_affinity_labels().await?;
    assert_eq!(labels.len(), 1);
    engine.close().await?;

    let requests = stub.requests();
    let login = &requests[0];
    assert_eq!(login.path, "/ovirt-engine/sso/oauth/token");
    assert!(login.body.contains("grant_type=password"));
    assert!(login.body.contains("scope=ovirt-app-api"));
    assert!(login.body.contains("username=admin%40internal"));

    assert_eq!(requests[1].authorization.as_deref(), Some("Bearer tok-issued"));

    let revoke = requests.last().expect("revoke issued");
    assert_eq!(revoke.path, "/ovirt-engine/sso/oauth/revoke");
    assert!(revoke.body.contains("token=tok-issued"));
    Ok(())
}

#[tokio::test]
async fn test_caller_supplied_token_survives_close() -> Result<()> {
    let stub = StubEngine::example();
    let url = serve(stub.clone()).await?;
    let engine = RestEngine::connect(&token_settings(&url)).await?;
    let params = ModuleParams::from_json(r#"{"name": "mylabel", "state": "absent"}"#)?;

    let result = run_module(&engine, &params, &ErrorContext::new(file!(), "remove label")).await;

    assert!(result.changed);
    assert!(stub.state.lock().unwrap().labels.is_empty());
    assert!(stub.requests().iter().all(|r| !r.path.contains("/sso/")));
    Ok(())
}

#[tokio::test]
async fn test_refused_login_is_an_auth_error() -> Result<()> {
    let stub = StubEngine::example();
    stub.set_sso(Sso::Deny);
    let url = serve(stub.clone()).await?;

    let err = RestEngine::connect(&password_settings(&url)).await.err().expect("login refused");

    match err {
        LabelError::Engine(EngineError::Auth { message }) => {
            assert!(message.contains("Cannot authenticate"));
        }
        other => panic!("expected an auth error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_plain_text_sso_failure_is_a_fault() -> Result<()> {
    let stub = StubEngine::example();
    stub.set_sso(Sso::Missing);
    let url = serve(stub.clone()).await?;

    let err = RestEngine::connect(&password_settings(&url)).await.err().expect("no sso endpoint");

    match err {
        LabelError::Engine(EngineError::Fault { status, detail, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(detail.as_deref(), Some("Not Found"));
        }
        other => panic!("expected a fault, got {other:?}"),
    }
    Ok(())
}
