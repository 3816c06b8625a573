use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::api::Api;

use crate::resources::inferenceservices::InferenceService;
use crate::scaling::HpaSpec;
use crate::Result;

use super::owned::{apply_owned, exact, superset, OwnedField};
use super::{object_meta, ChildAction};

const OWNED_FIELDS: &[OwnedField] = &[
    superset("/metadata/labels"),
    superset("/spec/scaleTargetRef"),
    exact("/spec/minReplicas"),
    exact("/spec/maxReplicas"),
    superset("/spec/metrics"),
];

pub fn desired_hpa(
    isvc: &InferenceService,
    namespace: &str,
    spec: &HpaSpec,
) -> Result<HorizontalPodAutoscaler> {
    Ok(HorizontalPodAutoscaler {
        metadata: object_meta(isvc, namespace)?,
        spec: Some(spec.to_autoscaling_v2()),
        status: None,
    })
}

pub async fn reconcile_hpa(
    api: &Api<HorizontalPodAutoscaler>,
    isvc: &InferenceService,
    namespace: &str,
    spec: &HpaSpec,
) -> Result<ChildAction> {
    let hpa = desired_hpa(isvc, namespace, spec)?;
    Ok(apply_owned(api, &hpa, OWNED_FIELDS).await?.action)
}
