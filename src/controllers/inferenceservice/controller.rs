use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroup, Time};
use kube::runtime::events::Recorder;
use kube::runtime::{metadata_watcher, reflector, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::{Diagnostics, State};
use crate::resources::inferenceservices::{
    InferenceService, InferenceServiceCondition, InferenceServiceStatus,
};
use crate::resources::keda::ScaledObject;
use crate::resources::knative::{KnativeService, KnativeServiceStatus};
use crate::scaling::Capabilities;
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::{reconcile_children, ReconcileReport, Settings, FIELD_MANAGER};

/// How often a pass that hit a write conflict is restarted from a fresh read before giving up
const MAX_CONFLICT_RETRIES: usize = 3;

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Default mode and the optional CRDs found at startup
    pub settings: Settings,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: &State, settings: Settings) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "isvc-scaling-operator".into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            settings,
        })
    }
}

#[instrument(skip(ctx, isvc), fields(trace_id))]
async fn reconcile(isvc: Arc<InferenceService>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<InferenceService>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    if isvc.meta().deletion_timestamp.is_some() {
        // children go away through their owner references
        debug!("InferenceService {} is being deleted", isvc.name_any());
        return Ok(Action::await_change());
    }

    let namespace = match isvc.metadata.namespace.as_deref() {
        Some("") | None => "default".to_string(),
        Some(ns) => ns.to_string(),
    };
    let isvc_api: Api<InferenceService> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = isvc.name_any();

    info!("Reconciling InferenceService {name} in namespace {namespace}");

    let mut current = isvc;
    let mut attempt = 0;
    let outcome = loop {
        match reconcile_children(&ctx.client, &current, &namespace, &ctx.settings).await {
            Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!("Write conflict on InferenceService {name}, starting over from a fresh read (attempt {attempt})");
                match isvc_api.get_opt(&name).await? {
                    Some(fresh) => current = Arc::new(fresh),
                    None => return Ok(Action::await_change()),
                }
            }
            outcome => break outcome,
        }
    };

    if let Ok(report) = &outcome {
        for (kind, action) in report.writes() {
            ctx.metrics.child_operation(kind.as_str(), action.as_str());
        }
        info!("{report}");
    }

    current
        .reconcile_status(&ctx, &isvc_api, &namespace, outcome)
        .await
}

fn error_policy(_isvc: Arc<InferenceService>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

impl InferenceService {
    /// Record the outcome of a pass in the Ready condition and decide what happens next
    async fn reconcile_status(
        &self,
        ctx: &Context,
        isvc_api: &Api<InferenceService>,
        namespace: &str,
        outcome: Result<ReconcileReport>,
    ) -> Result<Action> {
        let mut isvc_status = self.status.clone().unwrap_or_default();
        let existing_ready = self.ready_condition();
        let now = Utc::now();

        let (result, message, reason, status): (Result<Action>, String, String, String) =
            match outcome {
                Ok(report) => {
                    isvc_status.deployment_mode = Some(report.mode.as_str().into());
                    isvc_status.autoscaler_class = Some(report.class.as_str().into());
                    isvc_status.url = report.url.clone();
                    isvc_status.replicas = report.replicas;

                    if report.is_waiting() {
                        (
                            Ok(Action::requeue(Duration::from_secs(5))),
                            "A predictor resource is terminating and will be recreated once it is gone".into(),
                            "ChildTerminating".into(),
                            "False".into(),
                        )
                    } else {
                        (
                            Ok(Action::requeue(Duration::from_secs(5 * 60))),
                            format!("{} predictor is scaled by {}", report.mode, report.class),
                            "Reconciled".into(),
                            "True".into(),
                        )
                    }
                }
                Err(err) if err.is_terminal() => {
                    warn!("InferenceService {} cannot be reconciled: {err}", self.name_any());
                    self.publish_warning(ctx, err.metric_label(), &err).await;
                    ctx.metrics.reconcile_failure(self, &err);
                    (
                        // nothing changes until the InferenceService does
                        Ok(Action::await_change()),
                        err.to_string(),
                        err.metric_label().into(),
                        "False".into(),
                    )
                }
                Err(err) => {
                    warn!("reconcile failed: {:?}", err);
                    self.publish_warning(ctx, "FailedReconcile", &err).await;
                    ctx.metrics.reconcile_failure(self, &err);
                    let message = err.to_string();
                    (
                        Err(err),
                        message,
                        "FailedReconcile".into(),
                        "Unknown".into(),
                    )
                }
            };

        let last_transition_time = if existing_ready.is_none_or(|r| r.status != status) {
            Time(now)
        } else {
            existing_ready
                .and_then(|r| r.last_transition_time.clone())
                .unwrap_or(Time(now))
        };

        let ready_condition = InferenceServiceCondition {
            last_transition_time: Some(last_transition_time),
            message: Some(message),
            reason: Some(reason),
            status,
            r#type: "Ready".into(),
        };

        isvc_status.conditions = Some(vec![ready_condition]);
        isvc_status.observed_generation = self.metadata.generation;

        let name = self.name_any();
        if status_unchanged(self.status.as_ref(), &isvc_status)? {
            debug!("Status of InferenceService {name} in namespace {namespace} is up to date");
            return result;
        }

        // Create the status update
        let new_status = json!({
            "apiVersion": InferenceService::api_version(&()),
            "kind": InferenceService::kind(&()),
            "status": isvc_status,
        });

        debug!("Updating status of InferenceService {name} in namespace {namespace}");

        let ps = PatchParams::apply(FIELD_MANAGER).force();
        let _o = isvc_api
            .patch_status(&name, &ps, &Patch::Apply(new_status))
            .await?;

        result
    }

    async fn publish_warning(&self, ctx: &Context, reason: &str, err: &Error) {
        let published = ctx
            .recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note: Some(err.to_string()),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await;
        if let Err(publish_err) = published {
            warn!("Failed to publish event for InferenceService {}: {publish_err}", self.name_any());
        }
    }
}

fn status_unchanged(
    existing: Option<&InferenceServiceStatus>,
    desired: &InferenceServiceStatus,
) -> Result<bool> {
    match existing {
        Some(existing) => Ok(serde_json::to_value(existing)? == serde_json::to_value(desired)?),
        None => Ok(false),
    }
}

fn group_matches<R: Resource<DynamicType = ()>>(group: &APIGroup) -> bool {
    group.name == R::group(&()) && group.versions.iter().any(|v| v.version == R::version(&()))
}

/// Run the InferenceService controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let api_groups = match client.list_api_groups().await {
        Ok(list) => list,
        Err(e) => {
            error!("Could not list api groups: {e:?}");
            std::process::exit(1);
        }
    };

    let capabilities = api_groups
        .groups
        .iter()
        .fold(Capabilities::default(), |caps, group| Capabilities {
            knative: caps.knative || group_matches::<KnativeService>(group),
            keda: caps.keda || group_matches::<ScaledObject>(group),
        });

    if capabilities.knative {
        info!("Knative Serving detected; enabling Serverless mode");
    } else {
        info!("Knative Serving not detected; Serverless InferenceServices will be rejected");
    }
    if capabilities.keda {
        info!("KEDA detected; enabling autoscalerClass keda");
    } else {
        info!("KEDA not detected; autoscalerClass keda will be rejected");
    }

    let isvc_api = Api::<InferenceService>::all(client.clone());
    let deploy_api = Api::<Deployment>::all(client.clone());
    let svc_api = Api::<Service>::all(client.clone());
    let hpa_api = Api::<HorizontalPodAutoscaler>::all(client.clone());

    if let Err(e) = isvc_api.list(&ListParams::default().limit(1)).await {
        error!("InferenceService is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all resources we create have this label
    let cfg = Config::default().labels("app.kubernetes.io/managed-by=isvc-scaling-operator");
    // but inferenceservices themselves dont
    let isvc_cfg = Config::default();

    let (isvc_store, isvc_writer) = reflector::store();
    let isvc_reflector = reflector(isvc_writer, watcher(isvc_api, isvc_cfg))
        .touched_objects()
        .default_backoff()
        // our own status writes must not trigger another pass
        .predicate_filter(changed_predicate);

    let deploy_watcher = watcher(deploy_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let svc_watcher = watcher(svc_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // svc has no generation so we hash the service spec to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let hpa_watcher = metadata_watcher(hpa_api, cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let controller = Controller::for_stream(isvc_reflector, isvc_store)
        .shutdown_on_signal()
        .owns_stream(deploy_watcher)
        .owns_stream(svc_watcher)
        .owns_stream(hpa_watcher);

    let controller = if capabilities.knative {
        let ksvc_api = Api::<KnativeService>::all(client.clone());
        let ksvc_watcher = watcher(ksvc_api, cfg.clone())
            .map(|event| ensure_deletion_change(event))
            .touched_objects()
            .default_backoff()
            // the route url lands in status
            .predicate_filter(changed_predicate.combine(status_predicate_serde));
        controller.owns_stream(ksvc_watcher)
    } else {
        controller
    };

    let controller = if capabilities.keda {
        let so_api = Api::<ScaledObject>::all(client.clone());
        let so_watcher = metadata_watcher(so_api, cfg.clone())
            .map(|event| ensure_deletion_change(event))
            .touched_objects()
            // avoid apply loops that seem to happen with crds
            .predicate_filter(changed_predicate);
        controller.owns_stream(so_watcher)
    } else {
        controller
    };

    let settings = Settings {
        default_deployment_mode: state.default_deployment_mode,
        capabilities,
    };

    controller
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, &state, settings),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}

trait MyHasStatus {
    type Status;

    fn status(&self) -> Option<&Self::Status>;
}

impl MyHasStatus for Deployment {
    type Status = DeploymentStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for KnativeService {
    type Status = KnativeServiceStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

fn status_predicate_serde<K: Resource + MyHasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        serde_hashkey::to_key(s).ok()?.hash(&mut hasher);
    }
    Some(hasher.finish())
}

trait MyHasSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl MyHasSpec for Service {
    type Spec = Option<ServiceSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

fn spec_predicate_serde<K: Resource + MyHasSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(obj.spec()).ok()?.hash(&mut hasher);
    Some(hasher.finish())
}
