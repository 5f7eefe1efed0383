//! Watch filter for the BPM information secrets rendered for a deployment.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{runtime::reflector::ObjectRef, ResourceExt};

use crate::{
    deployment::BOSHDeployment,
    labels::{LABEL_DEPLOYMENT_NAME, LABEL_SECRET_KIND, SECRET_TYPE_BPM_INFORMATION, VERSIONED_SECRET_KIND},
};

/// Report whether a secret is a version of the BPM information of an instance group.
pub fn is_bpm_info_secret(labels: &BTreeMap<String, String>, name: &str) -> bool {
    labels.get(LABEL_SECRET_KIND).map(String::as_str) == Some(VERSIONED_SECRET_KIND)
        && name.contains(&format!(".{SECRET_TYPE_BPM_INFORMATION}."))
}

/// Map a BPM information secret to the deployment it was rendered for.
pub fn deployment_for_secret(secret: Secret) -> Option<ObjectRef<BOSHDeployment>> {
    if !is_bpm_info_secret(secret.labels(), &secret.name_any()) {
        return None;
    }
    let deployment = secret.labels().get(LABEL_DEPLOYMENT_NAME)?;
    Some(ObjectRef::new(deployment).within(&secret.namespace()?))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use kube::core::ObjectMeta;

    use super::{deployment_for_secret, is_bpm_info_secret};
    use crate::labels::{deployment_secret_name, SECRET_TYPE_BPM_INFORMATION};

    fn versioned() -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "quarks.cloudfoundry.org/secret-kind".to_owned(),
                "versionedSecret".to_owned(),
            ),
            (
                "quarks.cloudfoundry.org/deployment-name".to_owned(),
                "nats".to_owned(),
            ),
        ])
    }

    #[test]
    fn matches_versioned_bpm_secrets_only() {
        assert!(is_bpm_info_secret(&versioned(), "nats.bpm.nats-v1"));
        assert!(!is_bpm_info_secret(&versioned(), "nats.ig-resolved.nats-v1"));
        assert!(!is_bpm_info_secret(&BTreeMap::new(), "nats.bpm.nats-v1"));
    }

    #[test]
    fn matches_bpm_secrets_of_long_deployment_names() {
        let bpm_type = format!("{SECRET_TYPE_BPM_INFORMATION}.nats");
        for length in [60, 300] {
            let name = deployment_secret_name(&bpm_type, &"d".repeat(length));
            assert!(is_bpm_info_secret(&versioned(), &format!("{name}-v1")));
        }
    }

    #[test]
    fn maps_to_the_deployment() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("nats.bpm.nats-v2".to_owned()),
                namespace: Some("default".to_owned()),
                labels: Some(versioned()),
                ..Default::default()
            },
            ..Default::default()
        };
        let deployment = deployment_for_secret(secret).expect("secret should match");
        assert_eq!(deployment.name, "nats");
        assert_eq!(deployment.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn other_secrets_are_ignored() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("nats.with-ops".to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(deployment_for_secret(secret).is_none());
    }
}
