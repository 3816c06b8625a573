//! Diffing and applying predictor children on an explicit allow-list of owned fields.
//!
//! Only the listed JSON pointers are compared and only they are sent in an apply, so fields that
//! other controllers or users manage on the same object (HPA-driven replica counts, server
//! defaults, extra annotations) are never reverted.
//!
//! Every apply stamps a digest of the applied projection on the child. A child whose digest
//! differs from the current projection is stale even when the live object still contains every
//! desired field, which is how removals (a dropped annotation, a container losing its limits)
//! reach the server: server-side apply prunes what this field manager no longer sends.

use std::fmt::Debug;

use kube::api::{Api, DeleteParams, Patch, PatchParams, Preconditions};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Digest;
use tracing::*;

use crate::scaling::TargetValue;
use crate::{Error, Result};

use super::{ChildAction, FIELD_MANAGER};

/// Digest of the owned projection this controller last applied to a child
pub const APPLIED_FIELDS_ANNOTATION: &str = "serving.kserve.io/applied-fields";
const APPLIED_FIELDS_POINTER: &str = "/metadata/annotations/serving.kserve.io~1applied-fields";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compare {
    /// Observed must equal desired; a field missing from desired must be missing from observed
    Exact,
    /// Observed may carry extra object keys, for example server defaults or user additions
    Superset,
}

#[derive(Clone, Copy, Debug)]
pub struct OwnedField {
    pub pointer: &'static str,
    pub compare: Compare,
}

pub const fn exact(pointer: &'static str) -> OwnedField {
    OwnedField {
        pointer,
        compare: Compare::Exact,
    }
}

pub const fn superset(pointer: &'static str) -> OwnedField {
    OwnedField {
        pointer,
        compare: Compare::Superset,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChildState<'f> {
    NoChildResource,
    ChildResourceSynced,
    ChildResourceStale(Vec<&'f str>),
    Deleting,
}

/// The outcome of [`apply_owned`]: what was done and the object before and after.
#[derive(Debug)]
pub struct Applied<K> {
    pub action: ChildAction,
    pub previous: Option<K>,
    pub current: K,
}

pub fn is_superset(observed: &Value, desired: &Value) -> bool {
    superset_of(observed, desired, false)
}

/// `quantities` is set for the values of `requests` and `limits` maps, which the API server
/// rewrites into canonical form (`0.5` comes back as `500m`, `1024Mi` as `1Gi`)
fn superset_of(observed: &Value, desired: &Value, quantities: bool) -> bool {
    match (observed, desired) {
        (_, Value::Null) => true,
        (Value::Object(o), Value::Object(d)) => d.iter().all(|(k, dv)| {
            dv.is_null()
                || o.get(k).is_some_and(|ov| {
                    if quantities {
                        same_quantity(ov, dv)
                    } else {
                        superset_of(ov, dv, k == "requests" || k == "limits")
                    }
                })
        }),
        (Value::Array(o), Value::Array(d)) => {
            o.len() == d.len() && o.iter().zip(d).all(|(ov, dv)| superset_of(ov, dv, false))
        }
        (o, d) => o == d,
    }
}

fn quantity(value: &Value) -> Option<f64> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    TargetValue::parse(&text).ok().map(|q| q.magnitude())
}

fn same_quantity(observed: &Value, desired: &Value) -> bool {
    if observed == desired {
        return true;
    }
    match (quantity(observed), quantity(desired)) {
        (Some(o), Some(d)) => (o - d).abs() <= f64::EPSILON * o.abs().max(d.abs()).max(1.0),
        _ => false,
    }
}

pub fn stale_fields<'f>(desired: &Value, observed: &Value, fields: &'f [OwnedField]) -> Vec<&'f str> {
    fields
        .iter()
        .filter(|field| {
            let d = desired.pointer(field.pointer);
            let o = observed.pointer(field.pointer);
            let synced = match field.compare {
                Compare::Exact => d == o,
                Compare::Superset => match (o, d) {
                    (_, None) => true,
                    (None, Some(d)) => d.is_null(),
                    (Some(o), Some(d)) => is_superset(o, d),
                },
            };
            !synced
        })
        .map(|field| field.pointer)
        .collect()
}

pub fn assess<'f>(desired: &Value, observed: Option<&Value>, fields: &'f [OwnedField]) -> ChildState<'f> {
    let Some(observed) = observed else {
        return ChildState::NoChildResource;
    };
    if observed.pointer("/metadata/deletionTimestamp").is_some_and(|t| !t.is_null()) {
        return ChildState::Deleting;
    }
    let mut stale = stale_fields(desired, observed, fields);
    let applied = observed.pointer(APPLIED_FIELDS_POINTER).and_then(Value::as_str);
    if applied != Some(applied_digest(desired, fields).as_str()) {
        stale.push(APPLIED_FIELDS_POINTER);
    }
    if stale.is_empty() {
        ChildState::ChildResourceSynced
    } else {
        ChildState::ChildResourceStale(stale)
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_pointer(target: &mut Value, pointer: &str, value: Value) {
    let tokens: Vec<String> = pointer.split('/').skip(1).map(unescape).collect();
    set_path(target, &tokens, value)
}

fn set_path(target: &mut Value, tokens: &[String], value: Value) {
    match tokens {
        [] => *target = value,
        [head, rest @ ..] => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                set_path(map.entry(head.clone()).or_insert(Value::Null), rest, value);
            }
        }
    }
}

fn owned_body(desired: &Value, fields: &[OwnedField]) -> Value {
    let mut body = Value::Object(Map::new());
    for pointer in [
        "/apiVersion",
        "/kind",
        "/metadata/name",
        "/metadata/namespace",
        "/metadata/ownerReferences",
    ] {
        if let Some(value) = desired.pointer(pointer) {
            set_pointer(&mut body, pointer, value.clone());
        }
    }
    for field in fields {
        if let Some(value) = desired.pointer(field.pointer) {
            set_pointer(&mut body, field.pointer, value.clone());
        }
    }
    body
}

/// Short hex digest of the owned projection of `desired`
pub fn applied_digest(desired: &Value, fields: &[OwnedField]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(owned_body(desired, fields).to_string().as_bytes());
    hasher.finalize()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The apply body for `desired`: its identity and owner references, the owned fields it sets,
/// the digest of those, and, when given, the observed resourceVersion so a concurrent write
/// turns the apply into a conflict.
pub fn project(desired: &Value, fields: &[OwnedField], resource_version: Option<&str>) -> Value {
    let mut body = owned_body(desired, fields);
    let digest = applied_digest(desired, fields);
    set_pointer(&mut body, APPLIED_FIELDS_POINTER, Value::String(digest));
    if let Some(rv) = resource_version {
        set_pointer(&mut body, "/metadata/resourceVersion", Value::String(rv.into()));
    }
    body
}

fn controller_uid<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.as_str())
}

pub fn is_owned_by<K: Resource>(obj: &K, uid: &str) -> bool {
    obj.owner_references().iter().any(|r| r.uid == uid)
}

/// Converge the owned fields of `desired` onto the live object of the same name.
/// Nothing is written when the live object is already in sync or is being deleted.
pub async fn apply_owned<K>(api: &Api<K>, desired: &K, fields: &[OwnedField]) -> Result<Applied<K>>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired.name_any();
    let kind = K::kind(&());
    let observed = api.get_opt(&name).await?;

    if let (Some(observed), Some(owner)) = (observed.as_ref(), controller_uid(desired)) {
        if controller_uid(observed).is_some_and(|uid| uid != owner) {
            return Err(Error::InvalidSpec(format!(
                "{kind} {name} already exists and is controlled by another object"
            )));
        }
    }

    let desired_value = serde_json::to_value(desired)?;
    let observed_value = observed.as_ref().map(serde_json::to_value).transpose()?;

    let state = assess(&desired_value, observed_value.as_ref(), fields);
    let (action, previous) = match (state, observed) {
        (ChildState::Deleting, Some(current)) => {
            debug!("{kind} {name} is being deleted; waiting for it to go away");
            return Ok(Applied {
                action: ChildAction::Waiting,
                previous: Some(current.clone()),
                current,
            });
        }
        (ChildState::ChildResourceSynced, Some(current)) => {
            return Ok(Applied {
                action: ChildAction::Unchanged,
                previous: Some(current.clone()),
                current,
            });
        }
        (ChildState::ChildResourceStale(paths), Some(previous)) => {
            debug!("{kind} {name} is stale at {paths:?}");
            (ChildAction::Patched, Some(previous))
        }
        (_, previous) => (ChildAction::Created, previous),
    };

    let body = project(
        &desired_value,
        fields,
        previous.as_ref().and_then(|p| p.resource_version()).as_deref(),
    );

    debug!("Applying {kind} {name}");
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let current = api.patch(&name, &params, &Patch::Apply(&body)).await?;

    Ok(Applied {
        action,
        previous,
        current,
    })
}

/// Delete the named object if it exists and is owned by `owner_uid`. Returns whether anything was deleted.
pub async fn delete_owned<K>(api: &Api<K>, name: &str, owner_uid: &str) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    let kind = K::kind(&());
    let Some(existing) = api.get_opt(name).await? else {
        return Ok(false);
    };
    if !is_owned_by(&existing, owner_uid) {
        debug!("Leaving {kind} {name} alone as it is not owned by this InferenceService");
        return Ok(false);
    }
    if existing.meta().deletion_timestamp.is_some() {
        return Ok(false);
    }

    debug!("Deleting {kind} {name}");
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            // ensure we delete the object we just checked the ownership of
            uid: existing.uid(),
            resource_version: None,
        }),
        ..Default::default()
    };
    match api.delete(name, &params).await {
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(false),
        Err(err) => Err(err.into()),
        Ok(_) => Ok(true),
    }
}
