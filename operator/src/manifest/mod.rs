//! Typed view of a BOSH deployment manifest.
//!
//! Only the parts the operator inspects are typed. Everything else is preserved as raw values
//! so a manifest survives a parse/serialize round trip.
pub(crate) mod ops;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key in the manifest properties under which resolved links are published.
pub const QUARKS_LINKS_PROPERTY: &str = "quarks_links";

/// A resolved deployment manifest.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct Manifest {
    /// Name of the deployment the manifest describes.
    #[serde(default)]
    pub name: String,
    /// Instance groups of the deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_groups: Vec<InstanceGroup>,
    /// Explicit variables, generated as secrets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    /// Free form deployment wide properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    /// Remaining manifest keys, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A group of identical instances running a set of jobs.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct InstanceGroup {
    /// Name of the instance group.
    pub name: String,
    /// Jobs running on every instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<Job>,
    /// Remaining instance group keys, e.g. instances or azs.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A release job placed on an instance group.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct Job {
    /// Name of the job within its release.
    pub name: String,
    /// Release providing the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Links consumed by the job, keyed by link name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumes: BTreeMap<String, Value>,
    /// Links provided by the job, keyed by link name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, Value>,
    /// Remaining job keys, e.g. properties.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// An explicit manifest variable.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct Variable {
    /// Name the variable is referenced by.
    pub name: String,
    /// Kind of value to generate, e.g. password or certificate.
    #[serde(rename = "type")]
    pub variable_type: String,
    /// Generation options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VariableOptions>,
}

/// Generation options of a variable.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct VariableOptions {
    /// Common name of a certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// Subject alternative names of a certificate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,
    /// Whether the certificate is a CA.
    #[serde(default)]
    pub is_ca: bool,
    /// Name of the variable holding the signing CA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// Link data published for a provider living outside of the manifest.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct QuarksLink {
    /// Type of the provided link.
    #[serde(rename = "type")]
    pub link_type: String,
    /// DNS address of the service in front of the provider.
    pub address: String,
    /// Pods backing the provider.
    pub instances: Vec<JobInstance>,
}

/// One member of the pod set backing a link provider.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct JobInstance {
    /// Name of the link secret the instance belongs to.
    pub name: String,
    /// Uid of the pod.
    pub id: String,
    /// Position of the pod in the listing.
    pub index: usize,
    /// IP of the pod.
    pub address: String,
    /// Set on the first instance only.
    pub bootstrap: bool,
}

impl Manifest {
    /// Parse a manifest from YAML.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Serialize the manifest to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Names of link providers consumed by some job but provided by none of them.
    ///
    /// A consumer names its provider with `from`, a provider publishes itself under `as`.
    pub fn missing_providers(&self) -> BTreeSet<String> {
        let jobs = || self.instance_groups.iter().flat_map(|ig| ig.jobs.iter());
        let provided: BTreeSet<&str> = jobs()
            .flat_map(|job| job.provides.values())
            .filter_map(|link| link_field(link, "as"))
            .collect();
        jobs()
            .flat_map(|job| job.consumes.values())
            .filter_map(|link| link_field(link, "from"))
            .filter(|name| !provided.contains(name))
            .map(str::to_owned)
            .collect()
    }

    /// Publish resolved links in the properties. An empty set leaves the manifest untouched.
    pub fn set_quarks_links(
        &mut self,
        links: BTreeMap<String, QuarksLink>,
    ) -> Result<(), serde_json::Error> {
        if links.is_empty() {
            return Ok(());
        }
        self.properties
            .insert(QUARKS_LINKS_PROPERTY.to_owned(), serde_json::to_value(links)?);
        Ok(())
    }
}

fn link_field<'a>(link: &'a Value, field: &str) -> Option<&'a str> {
    link.get(field).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NATS_MANIFEST: &str = r#"
name: nats-deployment
releases:
- name: nats
  version: "26"
instance_groups:
- name: nats
  instances: 2
  jobs:
  - name: nats
    release: nats
    provides:
      nats: {as: nats-internal}
    consumes:
      nats: {from: nats-internal}
      database: {from: db-provider}
      metrics: nil
variables:
- name: nats_password
  type: password
"#;

    #[test]
    fn missing_providers_excludes_internal_providers() {
        let manifest = Manifest::from_yaml(NATS_MANIFEST).unwrap();
        assert_eq!(
            manifest.missing_providers(),
            BTreeSet::from(["db-provider".to_owned()])
        );
    }

    #[test]
    fn no_consumers_no_missing_providers() {
        let manifest = Manifest {
            name: "nats-deployment".to_owned(),
            instance_groups: vec![InstanceGroup {
                name: "nats".to_owned(),
                jobs: vec![Job {
                    name: "nats".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(manifest.missing_providers().is_empty());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let manifest = Manifest::from_yaml(NATS_MANIFEST).unwrap();
        let reparsed = Manifest::from_yaml(&manifest.to_yaml().unwrap()).unwrap();
        assert_eq!(manifest, reparsed);
        assert!(manifest.extra.contains_key("releases"));
        assert_eq!(
            manifest.instance_groups[0].extra.get("instances"),
            Some(&Value::from(2))
        );
    }

    #[test]
    fn quarks_links_only_set_when_resolved() {
        let mut manifest = Manifest::default();
        manifest.set_quarks_links(BTreeMap::new()).unwrap();
        assert!(!manifest.properties.contains_key(QUARKS_LINKS_PROPERTY));

        manifest
            .set_quarks_links(BTreeMap::from([(
                "nats-secret".to_owned(),
                QuarksLink {
                    link_type: "nats".to_owned(),
                    address: "nats.default.svc.cluster.local".to_owned(),
                    instances: vec![JobInstance {
                        name: "nats-secret".to_owned(),
                        id: "uid-0".to_owned(),
                        index: 0,
                        address: "10.0.0.1".to_owned(),
                        bootstrap: true,
                    }],
                },
            )]))
            .unwrap();
        assert_eq!(
            manifest.properties[QUARKS_LINKS_PROPERTY],
            json!({
                "nats-secret": {
                    "type": "nats",
                    "address": "nats.default.svc.cluster.local",
                    "instances": [{
                        "name": "nats-secret",
                        "id": "uid-0",
                        "index": 0,
                        "address": "10.0.0.1",
                        "bootstrap": true,
                    }],
                },
            })
        );
    }
}
