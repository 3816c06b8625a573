//! An in-memory Kubernetes API server for reconciler tests.
//!
//! It understands just enough of the protocol for the calls the reconcilers make: item GETs,
//! server-side apply PATCHes (as a deep merge that prunes fields the previous apply set and the
//! current one drops) including the status and scale subresources,
//! DELETEs with uid preconditions, and POSTs for events. Every request is logged as
//! `METHOD path` so tests can assert on what was written.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

#[derive(Default)]
struct Store {
    objects: BTreeMap<String, Value>,
    /// Last apply body per object, standing in for managedFields
    applied: BTreeMap<String, Value>,
    requests: Vec<String>,
    conflicts: usize,
    version: u64,
}

impl Store {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Clone, Default)]
pub struct ApiServer {
    store: Arc<Mutex<Store>>,
}

pub fn item_path<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> String {
    format!("{}/{name}", K::url_path(&(), Some(namespace)))
}

fn status(code: StatusCode, reason: &str, message: String) -> (StatusCode, Value) {
    (
        code,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code.as_u16(),
        }),
    )
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn prune(target: &mut Value, previous: &Value, current: &Value) {
    if let (Value::Object(target), Value::Object(previous)) = (target, previous) {
        for (key, before) in previous {
            match current.get(key) {
                None => {
                    target.remove(key);
                }
                Some(now) => {
                    if let Some(value) = target.get_mut(key) {
                        prune(value, before, now);
                    }
                }
            }
        }
    }
}

impl ApiServer {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    /// A client whose requests are all answered by this server
    pub fn client(&self) -> Client {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        tokio::spawn(self.clone().serve(handle));
        Client::new(mock_service, "default")
    }

    async fn serve(self, mut handle: ApiServerHandle) {
        while let Some((request, send)) = handle.next_request().await {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            let bytes = request.into_body().collect_bytes().await.unwrap();
            let body: Value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };

            let (code, response) = self.respond(&method, &path, body);
            send.send_response(
                Response::builder()
                    .status(code)
                    .body(Body::from(serde_json::to_vec(&response).unwrap()))
                    .unwrap(),
            );
        }
    }

    fn respond(&self, method: &Method, path: &str, body: Value) -> (StatusCode, Value) {
        let mut store = self.store();
        store.requests.push(format!("{method} {path}"));

        let (key, subresource) = match path.rsplit_once('/') {
            Some((key, sub @ ("status" | "scale"))) => (key.to_string(), Some(sub)),
            _ => (path.to_string(), None),
        };

        match *method {
            Method::GET => match store.objects.get(&key) {
                Some(object) => (StatusCode::OK, object.clone()),
                None => status(StatusCode::NOT_FOUND, "NotFound", format!("{key} not found")),
            },
            Method::POST => {
                let name = body
                    .pointer("/metadata/name")
                    .and_then(Value::as_str)
                    .unwrap_or("generated")
                    .to_string();
                let mut object = body;
                object["metadata"]["resourceVersion"] = json!(store.next_version());
                store.objects.insert(format!("{key}/{name}"), object.clone());
                (StatusCode::CREATED, object)
            }
            Method::DELETE => {
                let Some(existing) = store.objects.get(&key) else {
                    return status(StatusCode::NOT_FOUND, "NotFound", format!("{key} not found"));
                };
                if let Some(uid) = body.pointer("/preconditions/uid") {
                    if existing.pointer("/metadata/uid") != Some(uid) {
                        return status(
                            StatusCode::CONFLICT,
                            "Conflict",
                            format!("uid precondition failed for {key}"),
                        );
                    }
                }
                store.applied.remove(&key);
                let removed = store.objects.remove(&key).unwrap_or_default();
                (StatusCode::OK, removed)
            }
            Method::PATCH => {
                if store.conflicts > 0 && !key.contains("/events") {
                    store.conflicts -= 1;
                    return status(
                        StatusCode::CONFLICT,
                        "Conflict",
                        format!("the object {key} has been modified"),
                    );
                }
                self.apply(&mut store, key, subresource, body)
            }
            _ => status(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("{method} is not supported"),
            ),
        }
    }

    fn apply(
        &self,
        store: &mut Store,
        key: String,
        subresource: Option<&str>,
        mut body: Value,
    ) -> (StatusCode, Value) {
        let existing = store.objects.get(&key).cloned();

        match (subresource, existing) {
            (Some(_), None) => status(StatusCode::NOT_FOUND, "NotFound", format!("{key} not found")),
            (Some("scale"), Some(mut object)) => {
                let replicas = body.pointer("/spec/replicas").cloned().unwrap_or(json!(0));
                object["spec"]["replicas"] = replicas.clone();
                object["metadata"]["resourceVersion"] = json!(store.next_version());
                let scale = json!({
                    "apiVersion": "autoscaling/v1",
                    "kind": "Scale",
                    "metadata": {
                        "name": object["metadata"]["name"],
                        "namespace": object["metadata"]["namespace"],
                    },
                    "spec": {"replicas": replicas},
                    "status": {"replicas": 0},
                });
                store.objects.insert(key, object);
                (StatusCode::OK, scale)
            }
            (Some(_), Some(mut object)) => {
                let before = object.clone();
                merge(&mut object["status"], &body["status"]);
                if object != before {
                    object["metadata"]["resourceVersion"] = json!(store.next_version());
                }
                store.objects.insert(key, object.clone());
                (StatusCode::OK, object)
            }
            (None, existing) => {
                let expected_version = body
                    .pointer_mut("/metadata")
                    .and_then(Value::as_object_mut)
                    .and_then(|m| m.remove("resourceVersion"));

                let body_snapshot = body.clone();
                let Some(mut object) = existing else {
                    if expected_version.is_some() {
                        return status(StatusCode::NOT_FOUND, "NotFound", format!("{key} not found"));
                    }
                    let mut object = body;
                    object["metadata"]["uid"] = json!(format!("uid-{}", store.version + 1));
                    object["metadata"]["generation"] = json!(1);
                    object["metadata"]["resourceVersion"] = json!(store.next_version());
                    if object["kind"] == "Deployment" && object["spec"]["replicas"].is_null() {
                        object["spec"]["replicas"] = json!(1);
                    }
                    store.applied.insert(key.clone(), body_snapshot);
                    store.objects.insert(key, object.clone());
                    return (StatusCode::CREATED, object);
                };

                if let Some(expected) = expected_version {
                    if object.pointer("/metadata/resourceVersion") != Some(&expected) {
                        return status(
                            StatusCode::CONFLICT,
                            "Conflict",
                            format!("the object {key} has been modified"),
                        );
                    }
                }

                let before = object.clone();
                if let Some(previous) = store.applied.get(&key) {
                    prune(&mut object, previous, &body);
                }
                merge(&mut object, &body);
                store.applied.insert(key.clone(), body_snapshot);
                if object != before {
                    if object["spec"] != before["spec"] {
                        let generation = before["metadata"]["generation"].as_i64().unwrap_or(0);
                        object["metadata"]["generation"] = json!(generation + 1);
                    }
                    object["metadata"]["resourceVersion"] = json!(store.next_version());
                }
                store.objects.insert(key, object.clone());
                (StatusCode::OK, object)
            }
        }
    }

    /// Store an object as if it had been created by a client, returning it with server fields set
    pub fn insert<K>(&self, namespace: &str, object: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let mut value = serde_json::to_value(object).unwrap();
        let mut store = self.store();
        let version = store.next_version();
        let metadata = &mut value["metadata"];
        metadata["namespace"] = json!(namespace);
        if metadata["uid"].is_null() {
            metadata["uid"] = json!(format!("uid-{version}"));
        }
        if metadata["generation"].is_null() {
            metadata["generation"] = json!(1);
        }
        metadata["resourceVersion"] = json!(version);

        let name = value["metadata"]["name"].as_str().unwrap().to_string();
        store
            .objects
            .insert(item_path::<K>(namespace, &name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.store()
            .objects
            .get(&item_path::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Mutate a stored object in place, as another client would
    pub fn modify<K>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Value))
    where
        K: Resource<DynamicType = ()>,
    {
        let mut store = self.store();
        let version = store.next_version();
        let object = store
            .objects
            .get_mut(&item_path::<K>(namespace, name))
            .unwrap();
        f(object);
        object["metadata"]["resourceVersion"] = json!(version);
    }

    /// Delete a stored object out-of-band, as a user or another controller would
    pub fn remove<K>(&self, namespace: &str, name: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        let key = item_path::<K>(namespace, name);
        let mut store = self.store();
        store.applied.remove(&key);
        store.objects.remove(&key);
    }

    /// Answer the next `n` PATCH requests with 409 Conflict
    pub fn fail_next_patches(&self, n: usize) {
        self.store().conflicts = n;
    }

    pub fn requests(&self) -> Vec<String> {
        self.store().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.store().requests.clear();
    }

    /// Logged requests whose method is `method`, skipping event writes
    pub fn writes(&self, method: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.starts_with(&format!("{method} ")) && !r.contains("/events"))
            .collect()
    }
}
