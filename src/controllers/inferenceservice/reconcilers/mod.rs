use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::client::Client;
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::resources::inferenceservices::{InferenceService, INFERENCE_SERVICE_LABEL};
use crate::resources::keda::ScaledObject;
use crate::resources::knative::KnativeService;
use crate::scaling::{
    self, AutoscalerClass, Capabilities, DeploymentMode, DesiredChildResource, ScalingIntent,
};
use crate::{Error, Result};

pub mod deployment;
pub mod hpa;
pub mod keda;
pub mod knative;
pub mod owned;
pub mod service;

pub const FIELD_MANAGER: &str = "isvc-scaling-operator";
/// Replica counts are written through the scale subresource under their own manager
pub const SCALE_FIELD_MANAGER: &str = "isvc-scaling-operator/replicas";
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const COMPONENT_LABEL: &str = "component";
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    Deployment,
    Service,
    HorizontalPodAutoscaler,
    ScaledObject,
    KnativeService,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Deployment => "Deployment",
            ChildKind::Service => "Service",
            ChildKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ChildKind::ScaledObject => "ScaledObject",
            ChildKind::KnativeService => "KnativeService",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildAction {
    Created,
    Patched,
    /// The replica count was written through the scale subresource
    Scaled,
    Deleted,
    Unchanged,
    /// The child is terminating and will be recreated once it is gone
    Waiting,
}

impl ChildAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildAction::Created => "created",
            ChildAction::Patched => "patched",
            ChildAction::Scaled => "scaled",
            ChildAction::Deleted => "deleted",
            ChildAction::Unchanged => "unchanged",
            ChildAction::Waiting => "waiting",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, ChildAction::Unchanged | ChildAction::Waiting)
    }
}

/// Controller-wide inputs to a reconcile pass
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub default_deployment_mode: DeploymentMode,
    pub capabilities: Capabilities,
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub mode: DeploymentMode,
    pub class: AutoscalerClass,
    pub changes: Vec<(ChildKind, ChildAction)>,
    pub url: Option<String>,
    /// Non-terminated pods of the RawDeployment predictor
    pub replicas: Option<i32>,
}

impl ReconcileReport {
    fn record(&mut self, kind: ChildKind, action: ChildAction) {
        self.changes.push((kind, action));
    }

    pub fn writes(&self) -> impl Iterator<Item = &(ChildKind, ChildAction)> {
        self.changes.iter().filter(|(_, action)| action.is_write())
    }

    pub fn is_waiting(&self) -> bool {
        self.changes
            .iter()
            .any(|(_, action)| *action == ChildAction::Waiting)
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let writes: Vec<String> = self
            .writes()
            .map(|(kind, action)| format!("{} {}", kind.as_str(), action.as_str()))
            .collect();
        if writes.is_empty() {
            write!(f, "{} predictor ({}) is up to date", self.mode, self.class)
        } else {
            write!(f, "{} predictor ({}): {}", self.mode, self.class, writes.join(", "))
        }
    }
}

pub fn predictor_name(isvc: &InferenceService) -> String {
    format!("{}-predictor", isvc.name_any())
}

/// Labels that select the predictor pods. Immutable once a Deployment exists.
pub fn selector_labels(isvc: &InferenceService) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INFERENCE_SERVICE_LABEL.into(), isvc.name_any()),
        (COMPONENT_LABEL.into(), "predictor".into()),
    ])
}

/// The InferenceService's annotations as they are propagated to children
pub fn propagated_annotations(isvc: &InferenceService) -> BTreeMap<String, String> {
    let mut annotations = isvc.annotations().clone();
    // if this is set on the isvc, don't propagate it
    annotations.remove(LAST_APPLIED_ANNOTATION);
    annotations
}

/// Metadata shared by every child: name, namespace, labels and the controller owner reference
pub fn object_meta(isvc: &InferenceService, namespace: &str) -> Result<ObjectMeta> {
    let owner_reference = isvc.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidSpec("InferenceService has no uid yet; it must be persisted first".into())
    })?;

    let mut labels = isvc.labels().clone();
    labels.extend(selector_labels(isvc));
    labels.insert(APP_MANAGED_BY_LABEL.into(), FIELD_MANAGER.into());

    Ok(ObjectMeta {
        name: Some(predictor_name(isvc)),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference]),
        ..Default::default()
    })
}

/// One full convergence pass for an InferenceService: pick the mode and autoscaler, synthesize the
/// desired scaling resource, remove children of any other shape, then create or patch the rest.
pub async fn reconcile_children(
    client: &Client,
    isvc: &InferenceService,
    namespace: &str,
    settings: &Settings,
) -> Result<ReconcileReport> {
    let annotations = isvc.annotations();
    let mode = scaling::select_mode(annotations, settings.default_deployment_mode)?;
    let intent = scaling::normalize(&isvc.spec.predictor, mode)?;
    let class = scaling::resolve_backend(mode, annotations, &intent)?;
    settings.capabilities.ensure_installed(mode, class)?;

    let name = predictor_name(isvc);
    let desired = scaling::synthesize(&intent, mode, class, &name);
    let uid = isvc.uid().ok_or_else(|| {
        Error::InvalidSpec("InferenceService has no uid yet; it must be persisted first".into())
    })?;

    debug!(
        mode = %mode,
        class = %class,
        metrics = intent.metrics.len(),
        "Resolved scaling configuration for InferenceService {} in namespace {namespace}",
        isvc.name_any()
    );

    let mut report = ReconcileReport {
        mode,
        class,
        changes: Vec::new(),
        url: None,
        replicas: None,
    };

    let deployments = Api::<Deployment>::namespaced(client.clone(), namespace);
    let services = Api::<Service>::namespaced(client.clone(), namespace);
    let hpas = Api::<HorizontalPodAutoscaler>::namespaced(client.clone(), namespace);
    let scaled_objects = Api::<ScaledObject>::namespaced(client.clone(), namespace);
    let knative_services = Api::<KnativeService>::namespaced(client.clone(), namespace);

    match desired {
        DesiredChildResource::ServerlessAnnotations(autoscaling) => {
            // the raw shape goes first so the two never serve side by side
            remove(&mut report, ChildKind::HorizontalPodAutoscaler, &hpas, &name, &uid).await?;
            if settings.capabilities.keda {
                remove(&mut report, ChildKind::ScaledObject, &scaled_objects, &name, &uid).await?;
            }
            remove(&mut report, ChildKind::Service, &services, &name, &uid).await?;
            remove(&mut report, ChildKind::Deployment, &deployments, &name, &uid).await?;

            let (action, ksvc) =
                knative::reconcile_knative_service(&knative_services, isvc, namespace, autoscaling)
                    .await?;
            report.record(ChildKind::KnativeService, action);
            report.url = ksvc.status.and_then(|s| s.url);
        }
        raw => {
            if settings.capabilities.knative {
                remove(&mut report, ChildKind::KnativeService, &knative_services, &name, &uid)
                    .await?;
            }

            let (actions, deployment) =
                deployment::reconcile_deployment(&deployments, isvc, namespace, &intent, class)
                    .await?;
            for action in actions {
                report.record(ChildKind::Deployment, action);
            }
            report.replicas = deployment.status.as_ref().and_then(|s| s.replicas);

            let action =
                service::reconcile_service(&services, isvc, namespace, &deployment).await?;
            report.record(ChildKind::Service, action);
            report.url = Some(service::cluster_local_url(&name, namespace)?);

            match raw {
                DesiredChildResource::Hpa(spec) => {
                    if settings.capabilities.keda {
                        remove(&mut report, ChildKind::ScaledObject, &scaled_objects, &name, &uid)
                            .await?;
                    }
                    let action = hpa::reconcile_hpa(&hpas, isvc, namespace, &spec).await?;
                    report.record(ChildKind::HorizontalPodAutoscaler, action);
                }
                DesiredChildResource::ScaledObject(spec) => {
                    remove(&mut report, ChildKind::HorizontalPodAutoscaler, &hpas, &name, &uid)
                        .await?;
                    let action =
                        keda::reconcile_scaled_object(&scaled_objects, isvc, namespace, spec)
                            .await?;
                    report.record(ChildKind::ScaledObject, action);
                }
                _ => {
                    remove(&mut report, ChildKind::HorizontalPodAutoscaler, &hpas, &name, &uid)
                        .await?;
                    if settings.capabilities.keda {
                        remove(&mut report, ChildKind::ScaledObject, &scaled_objects, &name, &uid)
                            .await?;
                    }
                }
            }
        }
    }

    Ok(report)
}

async fn remove<K>(
    report: &mut ReconcileReport,
    kind: ChildKind,
    api: &Api<K>,
    name: &str,
    owner_uid: &str,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + fmt::Debug + serde::de::DeserializeOwned,
{
    if owned::delete_owned(api, name, owner_uid).await? {
        report.record(kind, ChildAction::Deleted);
    }
    Ok(())
}

/// The replica bounds a Deployment is scaled within for the given intent and autoscaler
pub fn replica_bounds(intent: &ScalingIntent, class: AutoscalerClass) -> (i32, Option<i32>) {
    let floor = match class {
        // an HPA cannot hold a workload at zero
        AutoscalerClass::Hpa => 1,
        _ => 0,
    };
    (intent.min_replicas.max(floor), intent.max_bound())
}
