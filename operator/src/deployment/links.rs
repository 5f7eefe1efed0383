//! Resolution of links consumed by a deployment but provided outside of its manifest.
//!
//! A provider living in another deployment publishes a secret annotated with a provider
//! descriptor, plus a service annotated with the name of that secret. The service selects the
//! pods backing the provider, which become the link instances.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::{api::ListParams, Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    labels::{ANNOTATION_LINK_PROVIDER_SERVICE, ANNOTATION_LINK_PROVIDES, LABEL_DEPLOYMENT_NAME},
    manifest::{JobInstance, Manifest, QuarksLink},
};

/// A secret satisfying one missing link provider, mounted into the instance group job.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    /// Name of the secret holding the link properties.
    pub secret_name: String,
    /// Name of the provider the secret satisfies.
    pub provider_name: String,
    /// Type of the provided link, empty when unknown.
    pub provider_type: String,
}

/// Errors resolving links.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Listing secrets failed.
    #[error("listing secrets for link in deployment")]
    ListSecrets(#[source] kube::Error),
    /// Listing services failed.
    #[error("listing services for link in deployment")]
    ListServices(#[source] kube::Error),
    /// Listing pods selected by a service failed.
    #[error("listing pods for link provider service")]
    ListPods(#[source] kube::Error),
    /// A secret carries a provider descriptor that is not valid JSON.
    #[error("malformed link provider descriptor on secret '{secret}'")]
    MalformedProvider {
        /// Name of the secret
        secret: String,
        /// Decoding error
        source: serde_json::Error,
    },
    /// Two secrets satisfy the same provider.
    #[error("duplicated secrets of provider: {0}")]
    DuplicateSecrets(String),
    /// Two services serve the same provider.
    #[error("duplicated services of provider: {0}")]
    DuplicateServices(String),
    /// A service selects no pod.
    #[error("got an empty list of pods")]
    NoPods,
    /// A selected pod has no address yet.
    #[error("empty ip of kube native component: '{0}'")]
    EmptyPodIp(String),
    /// Providers for which no secret exists, sorted.
    #[error("missing link secrets for providers: {}", .0.join(", "))]
    MissingProviders(Vec<String>),
    /// Links could not be written into the manifest.
    #[error("publishing links in manifest")]
    Publish(#[source] serde_json::Error),
}

// Descriptor found in the provides annotation of a link secret.
#[derive(Deserialize, Debug)]
struct ProviderDescriptor {
    name: String,
    #[serde(rename = "type", default)]
    provider_type: String,
}

// A typed provider waiting for the service that locates its instances.
struct PendingLink {
    service_key: String,
    link: QuarksLink,
}

// Service serving a provider.
struct ServiceRecord {
    selector: BTreeMap<String, String>,
    address: String,
}

/// Resolves missing link providers of a manifest against secrets, services and pods.
pub struct LinkResolver {
    client: Client,
    cluster_domain: String,
}

impl LinkResolver {
    /// Create a resolver building addresses within `cluster_domain`.
    pub fn new(client: Client, cluster_domain: impl Into<String>) -> Self {
        Self {
            client,
            cluster_domain: cluster_domain.into(),
        }
    }

    /// Find one secret per missing provider of the manifest and publish the typed providers as
    /// `quarks_links` properties.
    ///
    /// No API call is made when the manifest has no missing provider. On error the manifest is
    /// left untouched.
    pub async fn resolve(
        &self,
        namespace: &str,
        deployment_name: &str,
        manifest: &mut Manifest,
    ) -> Result<Vec<LinkInfo>, LinkError> {
        let mut missing: BTreeMap<String, bool> = manifest
            .missing_providers()
            .into_iter()
            .map(|name| (name, false))
            .collect();
        if missing.is_empty() {
            return Ok(vec![]);
        }
        debug!(deployment = deployment_name, providers = ?missing.keys(), "resolving links");

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secrets = secrets
            .list(&ListParams::default())
            .await
            .map_err(LinkError::ListSecrets)?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let services = services
            .list(&ListParams::default())
            .await
            .map_err(LinkError::ListServices)?;

        let mut link_infos = Vec::new();
        let mut pending = BTreeMap::new();
        for secret in &secrets.items {
            if secret.annotations().get(LABEL_DEPLOYMENT_NAME).map(String::as_str)
                != Some(deployment_name)
            {
                continue;
            }
            let Some(provider) = provider_descriptor(secret)? else {
                continue;
            };
            let Some(found) = missing.get_mut(&provider.name) else {
                continue;
            };
            if *found {
                return Err(LinkError::DuplicateSecrets(provider.name));
            }
            *found = true;

            let secret_name = secret.name_any();
            if !provider.provider_type.is_empty() {
                pending.insert(
                    secret_name.clone(),
                    PendingLink {
                        // The provider's service is annotated with the name of its secret.
                        service_key: secret_name.clone(),
                        link: QuarksLink {
                            link_type: provider.provider_type.clone(),
                            ..Default::default()
                        },
                    },
                );
            }
            link_infos.push(LinkInfo {
                secret_name,
                provider_name: provider.name,
                provider_type: provider.provider_type,
            });
        }

        let records = self.service_records(namespace, deployment_name, &services.items)?;
        let mut links = BTreeMap::new();
        for (secret_name, mut pending_link) in pending {
            if let Some(record) = records.get(&pending_link.service_key) {
                let pods = self.pods(namespace, &record.selector).await?;
                pending_link.link.instances = job_instances(&pending_link.service_key, &pods)?;
                pending_link.link.address = record.address.clone();
            }
            links.insert(secret_name, pending_link.link);
        }

        let unresolved: Vec<String> = missing
            .into_iter()
            .filter(|(_, found)| !found)
            .map(|(name, _)| name)
            .collect();
        if !unresolved.is_empty() {
            return Err(LinkError::MissingProviders(unresolved));
        }

        manifest.set_quarks_links(links).map_err(LinkError::Publish)?;
        Ok(link_infos)
    }

    // Index services serving a link provider by the provider they serve.
    fn service_records(
        &self,
        namespace: &str,
        deployment_name: &str,
        services: &[Service],
    ) -> Result<BTreeMap<String, ServiceRecord>, LinkError> {
        let mut records = BTreeMap::new();
        for service in services {
            if service.annotations().get(LABEL_DEPLOYMENT_NAME).map(String::as_str)
                != Some(deployment_name)
            {
                continue;
            }
            let Some(provider) = service.annotations().get(ANNOTATION_LINK_PROVIDER_SERVICE) else {
                continue;
            };
            if records.contains_key(provider) {
                return Err(LinkError::DuplicateServices(provider.clone()));
            }
            let selector = service
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.clone())
                .unwrap_or_default();
            let address = format!(
                "{}.{namespace}.svc.{}",
                service.name_any(),
                self.cluster_domain
            );
            records.insert(provider.clone(), ServiceRecord { selector, address });
        }
        Ok(records)
    }

    async fn pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, LinkError> {
        let selector = selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(LinkError::ListPods)?;
        if pods.items.is_empty() {
            return Err(LinkError::NoPods);
        }
        Ok(pods.items)
    }
}

fn provider_descriptor(secret: &Secret) -> Result<Option<ProviderDescriptor>, LinkError> {
    let Some(descriptor) = secret.annotations().get(ANNOTATION_LINK_PROVIDES) else {
        return Ok(None);
    };
    serde_json::from_str(descriptor)
        .map(Some)
        .map_err(|source| LinkError::MalformedProvider {
            secret: secret.name_any(),
            source,
        })
}

// One instance per pod, the first one being the bootstrap instance.
fn job_instances(name: &str, pods: &[Pod]) -> Result<Vec<JobInstance>, LinkError> {
    pods.iter()
        .enumerate()
        .map(|(index, pod)| {
            let address = pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.clone())
                .filter(|ip| !ip.is_empty())
                .ok_or_else(|| {
                    LinkError::EmptyPodIp(format!(
                        "{}/{}",
                        pod.namespace().unwrap_or_default(),
                        pod.name_any()
                    ))
                })?;
            Ok(JobInstance {
                name: name.to_owned(),
                id: pod.uid().unwrap_or_default(),
                index,
                address,
                bootstrap: index == 0,
            })
        })
        .collect()
}
