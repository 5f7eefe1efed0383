//! Place all spec types into a single module so they can be used as a lightweight dependency
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD describing a BOSH deployment: a manifest plus optional ops files.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "quarks.cloudfoundry.org",
    version = "v1alpha1",
    kind = "BOSHDeployment",
    plural = "boshdeployments",
    shortname = "bdpl",
    status = "BOSHDeploymentStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BOSHDeploymentSpec {
    /// Source of the deployment manifest.
    pub manifest: ResourceReference,
    /// Ops files applied to the manifest, in order.
    #[serde(default)]
    pub ops: Vec<ResourceReference>,
}

/// Reference to a config map or secret in the namespace of the deployment.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct ResourceReference {
    /// Name of the referenced resource.
    pub name: String,
    /// Kind of the referenced resource.
    #[serde(rename = "type")]
    pub reference_type: ReferenceType,
}

/// Kinds of resources a manifest or ops file can be read from.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    /// A config map.
    #[default]
    ConfigMap,
    /// A secret.
    Secret,
}

/// Status of a deployment.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BOSHDeploymentStatus {
    /// Time the last reconcile completed.
    /// Used to keep the deployment from being reconciled again within the meltdown window.
    pub last_reconcile_time: Option<Time>,
}
