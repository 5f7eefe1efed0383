//! Resolution of a deployment's manifest and ops files into a single manifest.
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use crate::{
    deployment::{BOSHDeployment, ReferenceType, ResourceReference},
    manifest::{ops, Manifest},
};

/// Key holding the manifest in the referenced config map or secret.
pub const MANIFEST_KEY: &str = "manifest";
/// Key holding an ops document in the referenced config map or secret.
pub const OPS_KEY: &str = "ops";

/// Produces the manifest of a deployment with all its ops files applied.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Resolve the manifest, returning it with the names of the applied ops resources.
    async fn resolve(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<(Manifest, Vec<String>)>;
}

/// Resolver reading manifests and ops from config maps and secrets.
pub struct KubeManifestResolver {
    client: Client,
}

impl KubeManifestResolver {
    /// Create a resolver reading through the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn load(&self, namespace: &str, reference: &ResourceReference, key: &str) -> Result<String> {
        match reference.reference_type {
            ReferenceType::ConfigMap => {
                let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let config_map = config_maps
                    .get(&reference.name)
                    .await
                    .with_context(|| format!("reading config map '{}'", reference.name))?;
                config_map
                    .data
                    .and_then(|mut data| data.remove(key))
                    .ok_or_else(|| anyhow!("config map '{}' has no key '{key}'", reference.name))
            }
            ReferenceType::Secret => {
                let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let secret = secrets
                    .get(&reference.name)
                    .await
                    .with_context(|| format!("reading secret '{}'", reference.name))?;
                if let Some(value) = secret.data.and_then(|mut data| data.remove(key)) {
                    return String::from_utf8(value.0).with_context(|| {
                        format!("secret '{}' key '{key}' is not UTF-8", reference.name)
                    });
                }
                secret
                    .string_data
                    .and_then(|mut data| data.remove(key))
                    .ok_or_else(|| anyhow!("secret '{}' has no key '{key}'", reference.name))
            }
        }
    }
}

#[async_trait]
impl ManifestResolver for KubeManifestResolver {
    async fn resolve(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<(Manifest, Vec<String>)> {
        let spec = &deployment.spec;
        let text = self.load(namespace, &spec.manifest, MANIFEST_KEY).await?;
        let mut document: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing manifest '{}'", spec.manifest.name))?;

        let mut applied = Vec::with_capacity(spec.ops.len());
        for reference in &spec.ops {
            let text = self.load(namespace, reference, OPS_KEY).await?;
            let operations = ops::parse(&text)
                .with_context(|| format!("parsing ops '{}'", reference.name))?;
            ops::apply(&mut document, &operations)
                .with_context(|| format!("applying ops '{}'", reference.name))?;
            debug!(ops = reference.name, count = operations.len(), "applied ops");
            applied.push(reference.name.clone());
        }

        let manifest = serde_json::from_value(document)
            .with_context(|| format!("decoding manifest '{}'", spec.manifest.name))?;
        Ok((manifest, applied))
    }
}
