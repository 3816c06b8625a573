use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, Patch, PatchParams};
use kube::core::subresource::Scale;
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::resources::inferenceservices::InferenceService;
use crate::scaling::{AutoscalerClass, ScalingIntent};
use crate::{Error, Result};

use super::owned::{apply_owned, exact, superset, Applied, OwnedField};
use super::{
    object_meta, propagated_annotations, replica_bounds, selector_labels, ChildAction,
    SCALE_FIELD_MANAGER,
};

/// Records the min:max the replica count was last scaled for; 0 as max means unbounded
pub const REPLICA_BOUNDS_ANNOTATION: &str = "serving.kserve.io/replica-bounds";

// spec.replicas is deliberately absent: it belongs to the autoscaler
const OWNED_FIELDS: &[OwnedField] = &[
    superset("/metadata/labels"),
    superset("/metadata/annotations"),
    exact("/metadata/annotations/serving.kserve.io~1replica-bounds"),
    superset("/spec/selector"),
    superset("/spec/template"),
];

fn format_bounds((min, max): (i32, Option<i32>)) -> String {
    format!("{min}:{}", max.unwrap_or(0))
}

/// The predictor Deployment for a RawDeployment InferenceService, without a replica count
pub fn desired_deployment(
    isvc: &InferenceService,
    namespace: &str,
    bounds: (i32, Option<i32>),
) -> Result<Deployment> {
    let mut metadata = object_meta(isvc, namespace)?;
    let mut annotations = propagated_annotations(isvc);
    annotations.insert(REPLICA_BOUNDS_ANNOTATION.into(), format_bounds(bounds));
    metadata.annotations = Some(annotations);

    let template = isvc.spec.predictor.template.as_ref();
    let Some(spec) = template.and_then(|t| t.spec.clone()) else {
        return Err(Error::InvalidSpec(
            "RawDeployment mode requires spec.predictor.template.spec".into(),
        ));
    };
    let pod_spec: PodSpec = serde_json::from_value(spec).map_err(|err| {
        Error::InvalidSpec(format!("spec.predictor.template.spec is not a pod spec: {err}"))
    })?;

    let template_metadata = template.and_then(|t| t.metadata.as_ref());
    let mut pod_labels = template_metadata
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    // the selector must always match, so these win over user labels
    pod_labels.extend(selector_labels(isvc));

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(isvc)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: template_metadata.and_then(|m| m.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn current_replicas(deployment: &Deployment) -> Option<i32> {
    deployment.spec.as_ref().and_then(|s| s.replicas)
}

/// The replica count to write through the scale subresource, if any.
///
/// A new Deployment starts at its minimum. Afterwards the count belongs to the autoscaler and is
/// only touched when the bounds themselves change, in which case it is clamped into them.
pub fn scale_target(
    applied: &Applied<Deployment>,
    bounds: (i32, Option<i32>),
    class: AutoscalerClass,
) -> Option<i32> {
    let (min, max) = bounds;
    let target = match (&applied.action, &applied.previous) {
        (ChildAction::Waiting, _) => return None,
        (_, None) => min,
        (_, Some(previous)) => {
            let recorded = previous.annotations().get(REPLICA_BOUNDS_ANNOTATION);
            if recorded.map(String::as_str) == Some(format_bounds(bounds).as_str()) {
                return None;
            }
            match class {
                // nothing else scales the workload, so the minimum is the count
                AutoscalerClass::None => min,
                _ => current_replicas(previous)
                    .unwrap_or(1)
                    .clamp(min, max.unwrap_or(i32::MAX).max(min)),
            }
        }
    };
    (current_replicas(&applied.current) != Some(target)).then_some(target)
}

/// Apply the predictor Deployment and, when needed, set its replica count.
/// Returns every action taken and the Deployment as last seen.
pub async fn reconcile_deployment(
    api: &Api<Deployment>,
    isvc: &InferenceService,
    namespace: &str,
    intent: &ScalingIntent,
    class: AutoscalerClass,
) -> Result<(Vec<ChildAction>, Deployment)> {
    let bounds = replica_bounds(intent, class);
    let desired = desired_deployment(isvc, namespace, bounds)?;
    let applied = apply_owned(api, &desired, OWNED_FIELDS).await?;
    let mut actions = vec![applied.action];

    let target = scale_target(&applied, bounds, class);
    let mut deployment = applied.current;

    if let Some(replicas) = target {
        let name = deployment.name_any();
        debug!("Scaling Deployment {name} in namespace {namespace} to {replicas} replicas");

        let params = PatchParams::apply(SCALE_FIELD_MANAGER).force();
        let scale = api
            .patch_scale(
                &name,
                &params,
                &Patch::Apply(serde_json::json!({
                    "apiVersion": Scale::api_version(&()),
                    "kind": Scale::kind(&()),
                    "spec": { "replicas": replicas }
                })),
            )
            .await?;

        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = scale.spec.and_then(|s| s.replicas).or(Some(replicas));
        }
        actions.push(ChildAction::Scaled);
    }

    Ok((actions, deployment))
}
