//! QuarksJobs rendering the desired manifest and the per instance group manifests.
use std::collections::BTreeMap;

use anyhow::{bail, Result};
use k8s_openapi::api::{
    batch::v1::{JobSpec, JobTemplateSpec},
    core::v1::{
        Container, EnvVar, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
    },
};
use kube::core::ObjectMeta;

use crate::{
    config::OperatorConfig,
    deployment::links::LinkInfo,
    labels::{
        deployment_labels, deployment_secret_name, dns_label, variable_secret_name,
        SECRET_TYPE_BPM_INFORMATION, SECRET_TYPE_MANIFEST_WITH_OPS,
    },
    manifest::Manifest,
    quarks::{Output, QuarksJob, QuarksJobSpec, Trigger, TriggerStrategy},
};

/// Secret type tag of the desired manifest produced by the interpolation job.
pub const SECRET_TYPE_DESIRED_MANIFEST: &str = "desired-manifest";
/// Secret type tag of a resolved instance group manifest.
pub const SECRET_TYPE_INSTANCE_GROUP_RESOLVED: &str = "ig-resolved";
/// Environment variable telling instance group rendering whether this is the first rollout.
pub const INITIAL_ROLLOUT_ENV: &str = "INITIAL_ROLLOUT";

const SECRETS_DIR: &str = "/var/run/secrets";
const OUTPUT_FILE: &str = "output.json";

/// Builds the jobs of a deployment.
pub trait JobFactory: Send + Sync {
    /// Job interpolating variables into the manifest with ops, producing the desired manifest.
    fn variable_interpolation_job(&self, deployment_name: &str, manifest: &Manifest)
        -> Result<QuarksJob>;

    /// Job rendering one manifest per instance group from the desired manifest.
    fn instance_group_manifest_job(
        &self,
        deployment_name: &str,
        manifest: &Manifest,
        link_infos: &[LinkInfo],
        initial_rollout: bool,
    ) -> Result<QuarksJob>;
}

/// Job factory running the operator image.
pub struct QuarksJobFactory {
    image: String,
    image_pull_policy: String,
}

impl From<&OperatorConfig> for QuarksJobFactory {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            image: config.operator_image.clone(),
            image_pull_policy: config.image_pull_policy.clone(),
        }
    }
}

/// Name of the variable interpolation job of a deployment.
pub fn interpolation_job_name(deployment_name: &str) -> String {
    dns_label(&format!("dm-{deployment_name}"))
}

/// Name of the instance group manifest job of a deployment.
pub fn instance_group_job_name(deployment_name: &str) -> String {
    dns_label(&format!("ig-{deployment_name}"))
}

impl JobFactory for QuarksJobFactory {
    fn variable_interpolation_job(
        &self,
        deployment_name: &str,
        manifest: &Manifest,
    ) -> Result<QuarksJob> {
        let with_ops = deployment_secret_name(SECRET_TYPE_MANIFEST_WITH_OPS, deployment_name);
        let mut mounts = vec![secret_mount(&with_ops, format!("{SECRETS_DIR}/with-ops"))];
        mounts.extend(manifest.variables.iter().map(|variable| {
            secret_mount(
                &variable_secret_name(&variable.name),
                format!("{SECRETS_DIR}/variables/{}", variable.name),
            )
        }));

        let container = Container {
            name: SECRET_TYPE_DESIRED_MANIFEST.to_owned(),
            args: Some(vec!["util".to_owned(), "variable-interpolation".to_owned()]),
            env: Some(vec![
                env("BOSH_MANIFEST_PATH", format!("{SECRETS_DIR}/with-ops/manifest.yaml")),
                env("VARIABLES_DIR", format!("{SECRETS_DIR}/variables")),
            ]),
            ..self.container()
        };
        let output_map = BTreeMap::from([(
            container.name.clone(),
            BTreeMap::from([(
                OUTPUT_FILE.to_owned(),
                deployment_secret_name(SECRET_TYPE_DESIRED_MANIFEST, deployment_name),
            )]),
        )]);
        Ok(self.job(
            &interpolation_job_name(deployment_name),
            deployment_name,
            vec![container],
            mounts,
            output_map,
        ))
    }

    fn instance_group_manifest_job(
        &self,
        deployment_name: &str,
        manifest: &Manifest,
        link_infos: &[LinkInfo],
        initial_rollout: bool,
    ) -> Result<QuarksJob> {
        if manifest.instance_groups.is_empty() {
            bail!("manifest of deployment '{deployment_name}' has no instance groups");
        }
        let desired = deployment_secret_name(SECRET_TYPE_DESIRED_MANIFEST, deployment_name);
        let mut mounts = vec![secret_mount(&desired, format!("{SECRETS_DIR}/desired"))];
        mounts.extend(link_infos.iter().map(|info| {
            secret_mount(
                &info.secret_name,
                format!("{SECRETS_DIR}/links/{}", info.provider_name),
            )
        }));

        let mut output_map = BTreeMap::new();
        let containers = manifest
            .instance_groups
            .iter()
            .map(|ig| {
                let container = Container {
                    name: dns_label(&ig.name),
                    args: Some(vec![
                        "util".to_owned(),
                        "instance-group".to_owned(),
                        "--instance-group-name".to_owned(),
                        ig.name.clone(),
                    ]),
                    env: Some(vec![
                        env("BOSH_MANIFEST_PATH", format!("{SECRETS_DIR}/desired/{OUTPUT_FILE}")),
                        env("DEPLOYMENT_NAME", deployment_name.to_owned()),
                        env(INITIAL_ROLLOUT_ENV, initial_rollout.to_string()),
                    ]),
                    ..self.container()
                };
                let secret = |secret_type: &str| {
                    deployment_secret_name(&format!("{secret_type}.{}", ig.name), deployment_name)
                };
                output_map.insert(
                    container.name.clone(),
                    BTreeMap::from([
                        ("bpm.json".to_owned(), secret(SECRET_TYPE_BPM_INFORMATION)),
                        (
                            "ig-resolved.json".to_owned(),
                            secret(SECRET_TYPE_INSTANCE_GROUP_RESOLVED),
                        ),
                    ]),
                );
                container
            })
            .collect();

        Ok(self.job(
            &instance_group_job_name(deployment_name),
            deployment_name,
            containers,
            mounts,
            output_map,
        ))
    }
}

// A secret mounted read only, along with the volume it comes from.
struct SecretMount {
    volume: Volume,
    mount: VolumeMount,
}

fn secret_mount(secret_name: &str, path: String) -> SecretMount {
    // Volume names are DNS labels, dots are not allowed.
    let name = secret_name.replace('.', "-");
    SecretMount {
        volume: Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        mount: VolumeMount {
            name,
            mount_path: path,
            read_only: Some(true),
            ..Default::default()
        },
    }
}

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value),
        ..Default::default()
    }
}

impl QuarksJobFactory {
    fn container(&self) -> Container {
        Container {
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.image_pull_policy.clone()),
            ..Default::default()
        }
    }

    fn job(
        &self,
        name: &str,
        deployment_name: &str,
        containers: Vec<Container>,
        mounts: Vec<SecretMount>,
        output_map: BTreeMap<String, BTreeMap<String, String>>,
    ) -> QuarksJob {
        let volume_mounts: Vec<VolumeMount> = mounts.iter().map(|m| m.mount.clone()).collect();
        let containers = containers
            .into_iter()
            .map(|container| Container {
                volume_mounts: Some(volume_mounts.clone()),
                ..container
            })
            .collect();
        let labels = deployment_labels(deployment_name);
        let mut job = QuarksJob::new(
            name,
            QuarksJobSpec {
                output: Some(Output {
                    output_map,
                    secret_labels: labels.clone().unwrap_or_default(),
                    versioned: true,
                }),
                trigger: Trigger {
                    strategy: TriggerStrategy::Once,
                },
                template: JobTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: labels.clone(),
                        ..Default::default()
                    }),
                    spec: Some(JobSpec {
                        backoff_limit: Some(2),
                        template: PodTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: labels.clone(),
                                ..Default::default()
                            }),
                            spec: Some(PodSpec {
                                containers,
                                volumes: Some(mounts.into_iter().map(|m| m.volume).collect()),
                                restart_policy: Some("Never".to_owned()),
                                ..Default::default()
                            }),
                        },
                        ..Default::default()
                    }),
                },
                update_on_config_change: true,
            },
        );
        job.metadata.labels = labels;
        job
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{JobFactory, QuarksJobFactory};
    use crate::{
        config::OperatorConfig,
        deployment::links::LinkInfo,
        manifest::Manifest,
    };

    fn manifest() -> Manifest {
        serde_json::from_value(json!({
            "name": "nats",
            "instance_groups": [{ "name": "nats" }, { "name": "route_registrar" }],
            "variables": [{ "name": "nats_password", "type": "password" }],
        }))
        .unwrap()
    }

    fn factory() -> QuarksJobFactory {
        QuarksJobFactory::from(&OperatorConfig::default())
    }

    #[test]
    fn interpolation_job_mounts_manifest_and_variables() {
        let job = factory()
            .variable_interpolation_job("nats", &manifest())
            .unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("dm-nats"));
        let pod = job.spec.template.spec.unwrap().template.spec.unwrap();
        let volumes: Vec<_> = pod
            .volumes
            .unwrap()
            .into_iter()
            .map(|v| v.secret.unwrap().secret_name.unwrap())
            .collect();
        assert_eq!(volumes, vec!["nats.with-ops", "var-nats-password"]);
        assert_eq!(
            job.spec.output.unwrap().output_map["desired-manifest"]["output.json"],
            "nats.desired-manifest"
        );
    }

    #[test]
    fn instance_group_job_has_a_container_per_instance_group() {
        let links = vec![LinkInfo {
            secret_name: "link-db".to_owned(),
            provider_name: "db".to_owned(),
            provider_type: "database".to_owned(),
        }];
        let job = factory()
            .instance_group_manifest_job("nats", &manifest(), &links, true)
            .unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("ig-nats"));

        let output = job.spec.output.unwrap();
        assert_eq!(
            output.output_map["route-registrar"]["bpm.json"],
            "nats.bpm.route-registrar"
        );

        let pod = job.spec.template.spec.unwrap().template.spec.unwrap();
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["nats", "route-registrar"]);
        let rollout = pod.containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|env| env.name == "INITIAL_ROLLOUT")
            .and_then(|env| env.value.clone());
        assert_eq!(rollout.as_deref(), Some("true"));
        let mounts: Vec<_> = pod.containers[1]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(
            mounts,
            vec!["/var/run/secrets/desired", "/var/run/secrets/links/db"]
        );
    }

    #[test]
    fn instance_group_job_requires_instance_groups() {
        let err = factory()
            .instance_group_manifest_job("nats", &Manifest::default(), &[], false)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "manifest of deployment 'nats' has no instance groups"
        );
    }
}
