use kube::api::Api;

use crate::resources::inferenceservices::InferenceService;
use crate::resources::keda::{ScaledObject, ScaledObjectSpec};
use crate::Result;

use super::owned::{apply_owned, exact, superset, OwnedField};
use super::{object_meta, ChildAction};

// triggers are compared whole; KEDA does not default inside them
const OWNED_FIELDS: &[OwnedField] = &[
    superset("/metadata/labels"),
    superset("/spec/scaleTargetRef"),
    exact("/spec/minReplicaCount"),
    exact("/spec/maxReplicaCount"),
    exact("/spec/triggers"),
];

pub fn desired_scaled_object(
    isvc: &InferenceService,
    namespace: &str,
    spec: ScaledObjectSpec,
) -> Result<ScaledObject> {
    let metadata = object_meta(isvc, namespace)?;
    let mut scaled_object = ScaledObject::new(&super::predictor_name(isvc), spec);
    scaled_object.metadata = metadata;
    Ok(scaled_object)
}

pub async fn reconcile_scaled_object(
    api: &Api<ScaledObject>,
    isvc: &InferenceService,
    namespace: &str,
    spec: ScaledObjectSpec,
) -> Result<ChildAction> {
    let scaled_object = desired_scaled_object(isvc, namespace, spec)?;
    Ok(apply_owned(api, &scaled_object, OWNED_FIELDS).await?.action)
}
