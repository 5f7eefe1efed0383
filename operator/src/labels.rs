//! Label, annotation and name conventions shared by every resource the operator derives.
use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Label (and annotation) carrying the name of the owning deployment.
pub const LABEL_DEPLOYMENT_NAME: &str = "quarks.cloudfoundry.org/deployment-name";
/// Label identifying the kind of secret derived from a deployment.
pub const LABEL_DEPLOYMENT_SECRET_TYPE: &str = "quarks.cloudfoundry.org/secret-type";
/// Label marking a secret as one version of a versioned secret.
pub const LABEL_SECRET_KIND: &str = "quarks.cloudfoundry.org/secret-kind";
/// Value of [`LABEL_SECRET_KIND`] for versioned secrets.
pub const VERSIONED_SECRET_KIND: &str = "versionedSecret";

/// Annotation on a secret describing the link it provides, as `{"name": .., "type": ..}`.
pub const ANNOTATION_LINK_PROVIDES: &str = "quarks.cloudfoundry.org/provides";
/// Annotation on a service naming the link provider it serves.
pub const ANNOTATION_LINK_PROVIDER_SERVICE: &str = "quarks.cloudfoundry.org/link-provider-name";

/// Secret type tag of the manifest with ops applied.
pub const SECRET_TYPE_MANIFEST_WITH_OPS: &str = "with-ops";
/// Secret type tag of the rendered BPM information of an instance group.
pub const SECRET_TYPE_BPM_INFORMATION: &str = "bpm";

/// Longest DNS-1123 label, the limit for job and container names.
pub const MAX_LABEL_LENGTH: usize = 63;
/// Longest DNS-1123 subdomain, the limit for secret names.
pub const MAX_SUBDOMAIN_LENGTH: usize = 253;
// Hex digits of the name hash appended to shortened names.
const HASH_LENGTH: usize = 16;

/// Labels attached to every secret derived from a deployment.
pub fn deployment_secret_labels(
    deployment_name: &str,
    secret_type: &str,
) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![
        (LABEL_DEPLOYMENT_NAME.to_owned(), deployment_name.to_owned()),
        (LABEL_DEPLOYMENT_SECRET_TYPE.to_owned(), secret_type.to_owned()),
    ]))
}

/// Labels attached to every object owned by a deployment.
pub fn deployment_labels(deployment_name: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        LABEL_DEPLOYMENT_NAME.to_owned(),
        deployment_name.to_owned(),
    )]))
}

/// Label selector matching every object owned by some deployment.
pub fn deployment_label_selector() -> String {
    LABEL_DEPLOYMENT_NAME.to_owned()
}

/// Name of a secret derived from a deployment, e.g. `nats.with-ops`.
///
/// The type tag is never cut, only the deployment part is shortened.
pub fn deployment_secret_name(secret_type: &str, deployment_name: &str) -> String {
    let suffix = format!(".{}", sanitize(secret_type));
    let prefix = shorten(
        &sanitize(deployment_name),
        MAX_SUBDOMAIN_LENGTH.saturating_sub(suffix.len()),
    );
    format!("{prefix}{suffix}")
}

/// Name of the QuarksSecret, and of the secret it generates, for a manifest variable.
pub fn variable_secret_name(variable_name: &str) -> String {
    shorten(&sanitize(&format!("var-{variable_name}")), MAX_SUBDOMAIN_LENGTH)
}

/// Make a name acceptable as a DNS-1123 label, e.g. `dm-nats`.
pub fn dns_label(name: &str) -> String {
    shorten(&sanitize(name), MAX_LABEL_LENGTH)
}

/// Replace the characters not allowed in a DNS-1123 subdomain.
fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            _ => '-',
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_owned()
}

// Names longer than `max` keep a prefix and end with a hash of the full name.
// Expects a sanitized, hence ASCII, name.
fn shorten(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_owned();
    }
    let hash = hex::encode(Sha256::digest(name.as_bytes()));
    let hash = &hash[..HASH_LENGTH.min(max)];
    let keep = max.saturating_sub(hash.len() + 1);
    let prefix = name[..keep].trim_end_matches(|c| c == '-' || c == '.');
    if prefix.is_empty() {
        hash.to_owned()
    } else {
        format!("{prefix}-{hash}")
    }
}
