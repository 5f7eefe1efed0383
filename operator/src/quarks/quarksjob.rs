use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::JobTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A job whose container output is persisted into secrets.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "quarks.cloudfoundry.org",
    version = "v1alpha1",
    kind = "QuarksJob",
    plural = "quarksjobs",
    shortname = "qjob",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct QuarksJobSpec {
    /// Where the output files of each container are written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
    /// When the job runs.
    pub trigger: Trigger,
    /// Template of the job that is run.
    pub template: JobTemplateSpec,
    /// Run the job again when a mounted config map or secret changes.
    #[serde(default)]
    pub update_on_config_change: bool,
}

/// Mapping of container output files to secrets.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    /// Container name to output file name to secret name.
    pub output_map: BTreeMap<String, BTreeMap<String, String>>,
    /// Labels added to every output secret.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_labels: BTreeMap<String, String>,
    /// Write output into versioned secrets.
    #[serde(default)]
    pub versioned: bool,
}

/// Trigger of a job.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct Trigger {
    /// Strategy of the trigger.
    pub strategy: TriggerStrategy,
}

/// When a job is started.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStrategy {
    /// Run the job once, as soon as it is created.
    #[default]
    Once,
    /// Run the job now, then switch to manual.
    Now,
    /// Only run when triggered manually.
    Manual,
}
