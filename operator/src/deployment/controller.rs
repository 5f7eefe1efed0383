use std::{cmp::min, collections::BTreeMap, fmt, sync::Arc, time::Duration};

use futures::stream::StreamExt;
use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::Time,
    NamespaceResourceScope,
};
use kube::{
    api::{Patch, PatchParams},
    client::Client,
    core::ObjectMeta,
    runtime::{
        controller::Action,
        watcher::{self, Config},
        Controller,
    },
    Api, Resource, ResourceExt,
};
use opentelemetry::{global, KeyValue};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info};

use crate::{
    config::OperatorConfig,
    deployment::{
        bpm,
        job_factory::JobFactory,
        resolver::ManifestResolver,
        variables::VariablesConverter,
        BOSHDeployment, BOSHDeploymentStatus,
    },
    labels::{
        deployment_label_selector, deployment_secret_labels, deployment_secret_name,
        LABEL_SECRET_KIND, SECRET_TYPE_MANIFEST_WITH_OPS,
    },
    manifest::Manifest,
    meltdown::Window,
    quarks::{QuarksJob, QuarksSecret},
    utils::{
        create_or_update, reset_generated, set_controller_reference, Clock, Context,
        OperationResult,
    },
};

/// Key of the manifest in the manifest with ops secret.
pub const MANIFEST_SECRET_KEY: &str = "manifest.yaml";

/// Symbolic cause of a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The deployment could not be read.
    GetBOSHDeploymentError,
    /// The manifest or one of its ops files could not be resolved.
    WithOpsManifestError,
    /// Links to providers outside of the manifest could not be resolved.
    LinkResolutionError,
    /// The manifest with ops secret could not be written.
    ManifestWithOpsApplyError,
    /// The manifest variables could not be converted.
    BadManifestError,
    /// A variable QuarksSecret could not be written.
    VariableGenerationError,
    /// The variable interpolation job could not be built or written.
    DesiredManifestError,
    /// The instance group manifest job could not be built or written.
    InstanceGroupManifestError,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors produced by the reconcile function.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A step of the reconcile failed.
    #[error("{reason} of BOSHDeployment '{deployment}': {source:#}")]
    Reconcile {
        /// Namespace and name of the deployment
        deployment: String,
        /// Step that failed
        reason: Reason,
        /// Underlying failure
        source: anyhow::Error,
    },
    /// The reconcile did not complete in time.
    #[error("reconcile of BOSHDeployment '{deployment}' timed out after {timeout:?}")]
    Timeout {
        /// Namespace and name of the deployment
        deployment: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },
}

impl Error {
    /// Step that failed, if the reconcile did not time out.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Error::Reconcile { reason, .. } => Some(*reason),
            Error::Timeout { .. } => None,
        }
    }
}

fn fail<E: Into<anyhow::Error>>(deployment: &str, reason: Reason) -> impl FnOnce(E) -> Error + '_ {
    move |source| Error::Reconcile {
        deployment: deployment.to_owned(),
        reason,
        source: source.into(),
    }
}

/// Handle errors during reconciliation.
fn on_error(
    _deployment: Arc<BOSHDeployment>,
    _error: &Error,
    cx: Arc<Context<impl ManifestResolver, impl JobFactory, impl VariablesConverter, impl Clock>>,
) -> Action {
    Action::requeue(cx.config.error_requeue_after)
}

fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + DeserializeOwned,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Start a controller for the BOSHDeployment CRD.
pub async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    let k_client = Client::try_default().await?;
    let namespace = config.watch_namespace.clone();
    let context = Arc::new(Context::new(k_client.clone(), config));

    let deployments: Api<BOSHDeployment> = api(k_client.clone(), namespace.as_deref());
    let secrets: Api<Secret> = api(k_client.clone(), namespace.as_deref());
    let quarks_jobs: Api<QuarksJob> = api(k_client.clone(), namespace.as_deref());

    info!(namespace = ?namespace, "starting BOSHDeployment controller");
    Controller::new(deployments, Config::default())
        .owns(
            secrets.clone(),
            watcher::Config::default().labels(&deployment_label_selector()),
        )
        .owns(
            quarks_jobs,
            watcher::Config::default().labels(&deployment_label_selector()),
        )
        .watches(
            secrets,
            watcher::Config::default().labels(LABEL_SECRET_KIND),
            bpm::deployment_for_secret,
        )
        .shutdown_on_signal()
        .run(reconcile, on_error, context)
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((deployment, _)) => {
                    debug!(deployment.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
    Ok(())
}

// How a reconcile completed.
#[derive(Debug, PartialEq)]
enum Outcome {
    Deleted,
    Meltdown(Duration),
    Reconciled,
}

/// Perform a reconcile pass for the BOSHDeployment CRD
async fn reconcile(
    deployment: Arc<BOSHDeployment>,
    cx: Arc<Context<impl ManifestResolver, impl JobFactory, impl VariablesConverter, impl Clock>>,
) -> Result<Action, Error> {
    let meter = global::meter("quarks");
    let runs = meter
        .u64_counter("bosh_deployment_reconcile_count")
        .with_description("Number of BOSHDeployment reconciles")
        .init();

    let id = format!(
        "{}/{}",
        deployment.namespace().unwrap_or_default(),
        deployment.name_any()
    );
    let timeout = cx.config.ctx_timeout;
    let result = tokio::time::timeout(timeout, reconcile_(&deployment, cx.as_ref()))
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                deployment: id.clone(),
                timeout,
            })
        });

    let (label, result) = match result {
        Ok(Outcome::Meltdown(requeue_after)) => ("meltdown", Ok(Action::requeue(requeue_after))),
        Ok(Outcome::Deleted) | Ok(Outcome::Reconciled) => ("ok", Ok(Action::await_change())),
        Err(err) => ("err", Err(err)),
    };
    runs.add(
        1,
        &[KeyValue {
            key: "result".into(),
            value: label.into(),
        }],
    );
    result
}

async fn reconcile_(
    deployment: &BOSHDeployment,
    cx: &Context<impl ManifestResolver, impl JobFactory, impl VariablesConverter, impl Clock>,
) -> Result<Outcome, Error> {
    let name = deployment.name_any();
    let ns = deployment.namespace().unwrap_or_default();
    let id = format!("{ns}/{name}");

    // Work on the latest stored version, the queued one may be stale.
    let deployments: Api<BOSHDeployment> = Api::namespaced(cx.k_client.clone(), &ns);
    let Some(deployment) = deployments
        .get_opt(&name)
        .await
        .map_err(fail(&id, Reason::GetBOSHDeploymentError))?
    else {
        debug!(deployment = %id, "skip reconcile: BOSHDeployment not found");
        return Ok(Outcome::Deleted);
    };

    let last_reconcile = deployment
        .status
        .as_ref()
        .and_then(|status| status.last_reconcile_time.as_ref())
        .map(|time| time.0);
    let window = Window::new(cx.config.meltdown_duration, last_reconcile);
    if let Some(remaining) = window.remaining(cx.clock.now()) {
        let requeue_after = min(cx.config.meltdown_requeue_after, remaining);
        debug!(deployment = %id, ?requeue_after, "resource is in meltdown, requeue reconcile");
        return Ok(Outcome::Meltdown(requeue_after));
    }

    debug!(deployment = %id, "resolving manifest");
    let (mut manifest, ops) = cx
        .resolver
        .resolve(&deployment, &ns)
        .await
        .map_err(fail(&id, Reason::WithOpsManifestError))?;
    debug!(deployment = %id, ?ops, "resolved manifest");

    let link_infos = cx
        .links
        .resolve(&ns, &name, &mut manifest)
        .await
        .map_err(fail(&id, Reason::LinkResolutionError))?;

    debug!(deployment = %id, "creating manifest secret with ops applied");
    let with_ops = with_ops_secret(&deployment, &manifest)
        .map_err(fail(&id, Reason::ManifestWithOpsApplyError))?;
    let (with_ops, op) = create_or_update(cx.k_client.clone(), &ns, with_ops)
        .await
        .map_err(fail(&id, Reason::ManifestWithOpsApplyError))?;
    debug!(deployment = %id, secret = %with_ops.name_any(), %op, "synchronized manifest secret");

    let variables = cx
        .converter
        .variables(&name, &manifest.variables)
        .map_err(fail(&id, Reason::BadManifestError))?;
    for variable in variables {
        sync_variable(cx.k_client.clone(), &ns, &with_ops, variable)
            .await
            .map_err(fail(&id, Reason::VariableGenerationError))?;
    }

    debug!(deployment = %id, "creating desired manifest job");
    let job = cx
        .job_factory
        .variable_interpolation_job(&name, &manifest)
        .map_err(fail(&id, Reason::DesiredManifestError))?;
    sync_job(cx.k_client.clone(), &ns, &deployment, job)
        .await
        .map_err(fail(&id, Reason::DesiredManifestError))?;

    debug!(deployment = %id, "creating instance group manifest job");
    let initial_rollout = deployment.metadata.generation == Some(1);
    let job = cx
        .job_factory
        .instance_group_manifest_job(&name, &manifest, &link_infos, initial_rollout)
        .map_err(fail(&id, Reason::InstanceGroupManifestError))?;
    sync_job(cx.k_client.clone(), &ns, &deployment, job)
        .await
        .map_err(fail(&id, Reason::InstanceGroupManifestError))?;

    // Opens the meltdown window. Failing to record it only costs an earlier reconcile.
    let status = BOSHDeploymentStatus {
        last_reconcile_time: Some(Time(cx.clock.now())),
    };
    if let Err(err) = deployments
        .patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
    {
        error!(deployment = %id, %err, "failed to update reconcile timestamp");
    }

    info!(deployment = %id, links = link_infos.len(), "reconciled BOSHDeployment");
    Ok(Outcome::Reconciled)
}

/// Secret holding the manifest with ops applied and links resolved.
pub fn with_ops_secret(deployment: &BOSHDeployment, manifest: &Manifest) -> anyhow::Result<Secret> {
    let deployment_name = deployment.name_any();
    let mut metadata = ObjectMeta {
        name: Some(deployment_secret_name(
            SECRET_TYPE_MANIFEST_WITH_OPS,
            &deployment_name,
        )),
        namespace: deployment.namespace(),
        labels: deployment_secret_labels(&deployment_name, SECRET_TYPE_MANIFEST_WITH_OPS),
        ..Default::default()
    };
    set_controller_reference(deployment, &mut metadata)?;
    Ok(Secret {
        metadata,
        string_data: Some(BTreeMap::from([(
            MANIFEST_SECRET_KEY.to_owned(),
            manifest.to_yaml()?,
        )])),
        ..Default::default()
    })
}

// Variables are owned by the manifest secret. A changed variable is generated again.
async fn sync_variable(
    client: Client,
    ns: &str,
    with_ops: &Secret,
    mut variable: QuarksSecret,
) -> anyhow::Result<()> {
    set_controller_reference(with_ops, &mut variable.metadata)?;
    variable.metadata.namespace = Some(ns.to_owned());
    let (variable, op) = create_or_update(client.clone(), ns, variable).await?;
    debug!(quarks_secret = %variable.name_any(), %op, "synchronized variable");
    if op == OperationResult::Updated {
        reset_generated(client, ns, &variable.name_any()).await?;
    }
    Ok(())
}

async fn sync_job(
    client: Client,
    ns: &str,
    deployment: &BOSHDeployment,
    mut job: QuarksJob,
) -> anyhow::Result<()> {
    set_controller_reference(deployment, &mut job.metadata)?;
    job.metadata.namespace = Some(ns.to_owned());
    let (job, op) = create_or_update(client, ns, job).await?;
    debug!(quarks_job = %job.name_any(), %op, "synchronized job");
    Ok(())
}
