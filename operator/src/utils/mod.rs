//! Utils is shared functions and constants for the controller

use std::{collections::BTreeMap, fmt::Debug};

use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    chrono::{DateTime, Utc},
    ByteString, NamespaceResourceScope,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    client::Client,
    core::ObjectMeta,
    Api, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    config::OperatorConfig,
    deployment::{
        job_factory::{JobFactory, QuarksJobFactory},
        links::LinkResolver,
        resolver::{KubeManifestResolver, ManifestResolver},
        variables::{KubeConverter, VariablesConverter},
    },
    quarks::{QuarksJob, QuarksSecret},
    CONTROLLER_NAME,
};

/// Operator Context
pub struct Context<R, J, V, C> {
    /// Kube client
    pub k_client: Client,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Resolves manifests and ops files into the final manifest
    pub resolver: R,
    /// Builds the jobs of a deployment
    pub job_factory: J,
    /// Converts manifest variables into QuarksSecrets
    pub converter: V,
    /// Resolves links to providers outside of the manifest
    pub links: LinkResolver,
    /// Clock that provide the current time
    pub clock: C,
}

impl Context<KubeManifestResolver, QuarksJobFactory, KubeConverter, UtcClock> {
    /// Create new context
    pub fn new(k_client: Client, config: OperatorConfig) -> Self {
        Context {
            resolver: KubeManifestResolver::new(k_client.clone()),
            job_factory: QuarksJobFactory::from(&config),
            converter: KubeConverter,
            links: LinkResolver::new(k_client.clone(), config.cluster_domain.clone()),
            k_client,
            config,
            clock: UtcClock,
        }
    }
}

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of synchronizing a derived object with the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// The object did not exist and was created.
    Created,
    /// The object existed and differed from the desired state.
    Updated,
    /// The object already matched the desired state.
    Unchanged,
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationResult::Created => write!(f, "created"),
            OperationResult::Updated => write!(f, "updated"),
            OperationResult::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Copies the state managed by the operator from a desired object onto an existing one.
pub trait Mutate {
    /// Overwrite managed fields of `self` with those of `desired`.
    fn mutate(&mut self, desired: &Self);
}

impl Mutate for Secret {
    fn mutate(&mut self, desired: &Self) {
        mutate_meta(&mut self.metadata, &desired.metadata);
        // The API server only ever returns `data`, so compare in that form.
        let mut data = desired.data.clone().unwrap_or_default();
        if let Some(string_data) = &desired.string_data {
            data.extend(
                string_data
                    .iter()
                    .map(|(key, value)| (key.clone(), ByteString(value.clone().into_bytes()))),
            );
        }
        self.data = Some(data);
        self.string_data = None;
        if desired.type_.is_some() {
            self.type_ = desired.type_.clone();
        }
    }
}

impl Mutate for QuarksSecret {
    fn mutate(&mut self, desired: &Self) {
        mutate_meta(&mut self.metadata, &desired.metadata);
        self.spec = desired.spec.clone();
    }
}

impl Mutate for QuarksJob {
    fn mutate(&mut self, desired: &Self) {
        mutate_meta(&mut self.metadata, &desired.metadata);
        self.spec = desired.spec.clone();
    }
}

// Labels and annotations are merged so that keys added by others survive.
fn mutate_meta(existing: &mut ObjectMeta, desired: &ObjectMeta) {
    merge(&mut existing.labels, &desired.labels);
    merge(&mut existing.annotations, &desired.annotations);
    if let Some(desired_refs) = &desired.owner_references {
        let refs = existing.owner_references.get_or_insert_with(Vec::new);
        for oref in desired_refs {
            upsert_owner_reference(refs, oref.clone());
        }
    }
}

// An object has at most one controller, a new controller reference replaces the old one.
fn upsert_owner_reference(refs: &mut Vec<OwnerReference>, oref: OwnerReference) {
    if oref.controller == Some(true) {
        refs.retain(|existing| existing.controller != Some(true) || existing.uid == oref.uid);
    }
    match refs.iter_mut().find(|existing| existing.uid == oref.uid) {
        Some(existing) => *existing = oref,
        None => refs.push(oref),
    }
}

fn merge(existing: &mut Option<BTreeMap<String, String>>, desired: &Option<BTreeMap<String, String>>) {
    if let Some(desired) = desired {
        existing
            .get_or_insert_with(BTreeMap::new)
            .extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Errors building an owner reference.
#[derive(Debug, thiserror::Error)]
#[error("owner '{0}' has no uid, it must be persisted before it can own objects")]
pub struct MissingOwnerUid(pub String);

/// Make `owner` the controller of `object`, so deleting the owner deletes the object.
pub fn set_controller_reference<O>(owner: &O, object: &mut ObjectMeta) -> Result<(), MissingOwnerUid>
where
    O: Resource<DynamicType = ()>,
{
    let oref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| MissingOwnerUid(owner.name_any()))?;
    upsert_owner_reference(object.owner_references.get_or_insert_with(Vec::new), oref);
    Ok(())
}

/// Create the object if it does not exist, otherwise update it when it differs from the desired
/// state.
///
/// Returns the object as stored by the API server. Conflicts and any other API error are
/// returned as is, the caller retries by reconciling again.
pub async fn create_or_update<K>(
    client: Client,
    ns: &str,
    desired: K,
) -> Result<(K, OperationResult), kube::Error>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Mutate
        + Clone
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = Api::namespaced(client, ns);
    let name = desired.name_any();
    let params = PostParams {
        field_manager: Some(CONTROLLER_NAME.to_owned()),
        ..Default::default()
    };

    let Some(existing) = api.get_opt(&name).await? else {
        let created = api.create(&params, &desired).await?;
        return Ok((created, OperationResult::Created));
    };

    let mut updated = existing.clone();
    updated.mutate(&desired);
    if updated == existing {
        debug!(%name, "object is up to date");
        return Ok((existing, OperationResult::Unchanged));
    }
    let replaced = api.replace(&name, &params, &updated).await?;
    Ok((replaced, OperationResult::Updated))
}

/// Reset the generated flag of a QuarksSecret so its secret is generated again.
pub async fn reset_generated(
    client: Client,
    ns: &str,
    name: &str,
) -> Result<QuarksSecret, kube::Error> {
    let quarks_secrets: Api<QuarksSecret> = Api::namespaced(client, ns);
    quarks_secrets
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": { "generated": false } })),
        )
        .await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference, ByteString,
    };
    use kube::core::ObjectMeta;
    use serde_json::json;

    use super::{create_or_update, set_controller_reference, Mutate, OperationResult};
    use crate::deployment::BOSHDeployment;
    use crate::utils::test::{mock_client, timeout_after_1s};

    fn desired_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("nats.with-ops".to_owned()),
                labels: Some(BTreeMap::from([(
                    "quarks.cloudfoundry.org/deployment-name".to_owned(),
                    "nats".to_owned(),
                )])),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(
                "manifest.yaml".to_owned(),
                "name: nats\n".to_owned(),
            )])),
            ..Default::default()
        }
    }

    fn stored_secret(manifest: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("nats.with-ops".to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some("secret-uid".to_owned()),
                resource_version: Some("7".to_owned()),
                labels: Some(BTreeMap::from([
                    (
                        "quarks.cloudfoundry.org/deployment-name".to_owned(),
                        "nats".to_owned(),
                    ),
                    ("extra".to_owned(), "kept".to_owned()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "manifest.yaml".to_owned(),
                ByteString(manifest.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_missing_object() {
        let (client, mut server) = mock_client();
        let mocksrv = tokio::spawn(async move {
            server
                .handle_get::<Secret>("/api/v1/namespaces/default/secrets/nats.with-ops", None)
                .await;
            let body = server
                .handle_create("/api/v1/namespaces/default/secrets")
                .await;
            assert_eq!(body["stringData"], json!({"manifest.yaml": "name: nats\n"}));
        });
        let (secret, op) = create_or_update(client, "default", desired_secret())
            .await
            .expect("secret should be created");
        assert_eq!(op, OperationResult::Created);
        assert_eq!(secret.metadata.uid.as_deref(), Some("nats.with-ops-uid"));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn unchanged_object_is_not_written() {
        let (client, mut server) = mock_client();
        let mocksrv = tokio::spawn(async move {
            server
                .handle_get(
                    "/api/v1/namespaces/default/secrets/nats.with-ops",
                    Some(&stored_secret("name: nats\n")),
                )
                .await;
        });
        let (_, op) = create_or_update(client, "default", desired_secret())
            .await
            .expect("secret should be synchronized");
        assert_eq!(op, OperationResult::Unchanged);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn changed_object_is_replaced() {
        let (client, mut server) = mock_client();
        let mocksrv = tokio::spawn(async move {
            server
                .handle_get(
                    "/api/v1/namespaces/default/secrets/nats.with-ops",
                    Some(&stored_secret("name: old\n")),
                )
                .await;
            let body = server
                .handle_replace("/api/v1/namespaces/default/secrets/nats.with-ops")
                .await;
            // "name: nats\n" base64 encoded
            assert_eq!(body["data"], json!({"manifest.yaml": "bmFtZTogbmF0cwo="}));
            assert_eq!(body["metadata"]["labels"]["extra"], json!("kept"));
            assert_eq!(body["metadata"]["resourceVersion"], json!("7"));
            assert!(body.get("stringData").is_none());
        });
        let (_, op) = create_or_update(client, "default", desired_secret())
            .await
            .expect("secret should be replaced");
        assert_eq!(op, OperationResult::Updated);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn conflicts_are_returned_to_the_caller() {
        let (client, mut server) = mock_client();
        let mocksrv = tokio::spawn(async move {
            server
                .handle_get(
                    "/api/v1/namespaces/default/secrets/nats.with-ops",
                    Some(&stored_secret("name: old\n")),
                )
                .await;
            server
                .handle_error(
                    "PUT",
                    "/api/v1/namespaces/default/secrets/nats.with-ops",
                    409,
                    "Conflict",
                )
                .await;
        });
        let err = create_or_update(client, "default", desired_secret())
            .await
            .expect_err("conflict should fail");
        assert!(matches!(err, kube::Error::Api(ref response) if response.code == 409));
        timeout_after_1s(mocksrv).await;
    }

    fn controller_ref(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "quarks.cloudfoundry.org/v1alpha1".to_owned(),
            kind: "BOSHDeployment".to_owned(),
            name: "nats".to_owned(),
            uid: uid.to_owned(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn mutate_replaces_stale_controller_reference() {
        let mut existing = stored_secret("name: nats\n");
        let mut other = controller_ref("other");
        other.controller = None;
        existing.metadata.owner_references = Some(vec![controller_ref("old"), other]);
        let mut desired = desired_secret();
        desired.metadata.owner_references = Some(vec![controller_ref("new")]);

        existing.mutate(&desired);

        let refs = existing.metadata.owner_references.unwrap();
        let controllers: Vec<_> = refs
            .iter()
            .filter(|oref| oref.controller == Some(true))
            .map(|oref| oref.uid.as_str())
            .collect();
        assert_eq!(controllers, vec!["new"]);
        assert!(refs.iter().any(|oref| oref.uid == "other"));
    }

    #[test]
    fn controller_reference_requires_uid() {
        let mut deployment = BOSHDeployment::test();
        let mut meta = ObjectMeta::default();
        deployment.metadata.uid = None;
        assert!(set_controller_reference(&deployment, &mut meta).is_err());

        deployment.metadata.uid = Some("bdpl-uid".to_owned());
        set_controller_reference(&deployment, &mut meta).unwrap();
        set_controller_reference(&deployment, &mut meta).unwrap();
        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "bdpl-uid");
        assert_eq!(refs[0].kind, "BOSHDeployment");
        assert_eq!(refs[0].controller, Some(true));
    }
}
