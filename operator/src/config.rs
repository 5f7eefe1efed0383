//! Runtime configuration of the operator.
use std::time::Duration;

/// Settings shared by every reconcile.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace watched by the controller, all namespaces when unset.
    pub watch_namespace: Option<String>,
    /// Kubernetes cluster domain used to build service addresses.
    pub cluster_domain: String,
    /// Minimum interval between two completed reconciles of a deployment.
    pub meltdown_duration: Duration,
    /// Delay before retrying a deployment reconciled during its meltdown window.
    pub meltdown_requeue_after: Duration,
    /// Deadline of a single reconcile.
    pub ctx_timeout: Duration,
    /// Delay before retrying a failed reconcile.
    pub error_requeue_after: Duration,
    /// Image running the manifest rendering jobs.
    pub operator_image: String,
    /// Pull policy of the job image.
    pub image_pull_policy: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            cluster_domain: "cluster.local".to_owned(),
            meltdown_duration: Duration::from_secs(60),
            meltdown_requeue_after: Duration::from_secs(30),
            ctx_timeout: Duration::from_secs(300),
            error_requeue_after: Duration::from_secs(5),
            operator_image: "cfcontainerization/cf-operator:latest".to_owned(),
            image_pull_policy: "IfNotPresent".to_owned(),
        }
    }
}

/// Command line options of the controller.
#[derive(clap::Args, Debug, Clone)]
pub struct ControllerOpts {
    /// Namespace to watch, all namespaces when unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Kubernetes cluster domain.
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    /// Seconds during which a reconciled deployment is not reconciled again.
    #[arg(long, env = "QUARKS_MELTDOWN_DURATION", default_value_t = 60)]
    pub meltdown_duration: u64,

    /// Seconds to wait before retrying a deployment inside its meltdown window.
    #[arg(long, env = "QUARKS_MELTDOWN_REQUEUE_AFTER", default_value_t = 30)]
    pub meltdown_requeue_after: u64,

    /// Seconds a single reconcile may take.
    #[arg(long, env = "QUARKS_CTX_TIMEOUT", default_value_t = 300)]
    pub ctx_timeout: u64,

    /// Seconds to wait before retrying a failed reconcile.
    #[arg(long, env = "QUARKS_ERROR_REQUEUE_AFTER", default_value_t = 5)]
    pub error_requeue_after: u64,

    /// Image of the jobs rendering manifests.
    #[arg(
        long,
        env = "QUARKS_OPERATOR_IMAGE",
        default_value = "cfcontainerization/cf-operator:latest"
    )]
    pub operator_image: String,

    /// Pull policy of the job image.
    #[arg(long, env = "QUARKS_IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    pub image_pull_policy: String,
}

impl From<ControllerOpts> for OperatorConfig {
    fn from(opts: ControllerOpts) -> Self {
        Self {
            watch_namespace: opts.watch_namespace,
            cluster_domain: opts.cluster_domain,
            meltdown_duration: Duration::from_secs(opts.meltdown_duration),
            meltdown_requeue_after: Duration::from_secs(opts.meltdown_requeue_after),
            ctx_timeout: Duration::from_secs(opts.ctx_timeout),
            error_requeue_after: Duration::from_secs(opts.error_requeue_after),
            operator_image: opts.operator_image,
            image_pull_policy: opts.image_pull_policy,
        }
    }
}
