//! Conversion of manifest variables into QuarksSecrets.
use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::{
    labels::{deployment_secret_labels, variable_secret_name},
    manifest::Variable,
    quarks::{CertificateRequest, QuarksSecret, QuarksSecretSpec, Request, SecretReference, SecretType},
};

/// Secret type tag of generated variables.
pub const SECRET_TYPE_VARIABLE: &str = "variable";

/// Turns manifest variables into the QuarksSecrets generating them.
pub trait VariablesConverter: Send + Sync {
    /// Convert every variable. Returned objects carry no owner and no namespace.
    fn variables(&self, deployment_name: &str, variables: &[Variable]) -> Result<Vec<QuarksSecret>>;
}

/// Converter producing one QuarksSecret per variable.
pub struct KubeConverter;

impl VariablesConverter for KubeConverter {
    fn variables(&self, deployment_name: &str, variables: &[Variable]) -> Result<Vec<QuarksSecret>> {
        // Each variable needs a secret of its own.
        let mut names = BTreeMap::new();
        for variable in variables {
            let name = variable_secret_name(&variable.name);
            if let Some(other) = names.insert(name.clone(), &variable.name) {
                bail!(
                    "variables '{other}' and '{}' both map to secret '{name}'",
                    variable.name
                );
            }
        }
        variables
            .iter()
            .map(|variable| quarks_secret(deployment_name, variable))
            .collect()
    }
}

fn quarks_secret(deployment_name: &str, variable: &Variable) -> Result<QuarksSecret> {
    let name = variable_secret_name(&variable.name);
    let (secret_type, request) = match variable.variable_type.as_str() {
        "password" => (SecretType::Password, None),
        "ssh" => (SecretType::Ssh, None),
        "rsa" => (SecretType::Rsa, None),
        "certificate" => (SecretType::Certificate, Some(certificate_request(variable))),
        other => bail!("variable '{}' has unsupported type '{other}'", variable.name),
    };
    let mut quarks_secret = QuarksSecret::new(
        &name,
        QuarksSecretSpec {
            secret_type,
            secret_name: name.clone(),
            request,
        },
    );
    quarks_secret.metadata.labels = deployment_secret_labels(deployment_name, SECRET_TYPE_VARIABLE);
    Ok(quarks_secret)
}

fn certificate_request(variable: &Variable) -> Request {
    let options = variable.options.clone().unwrap_or_default();
    let ca = options.ca.as_deref().map(variable_secret_name);
    Request {
        certificate: Some(CertificateRequest {
            common_name: options.common_name,
            alternative_names: options.alternative_names,
            is_ca: options.is_ca,
            ca_ref: ca.clone().map(|name| SecretReference {
                name,
                key: "certificate".to_owned(),
            }),
            ca_key_ref: ca.map(|name| SecretReference {
                name,
                key: "private_key".to_owned(),
            }),
        }),
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::{KubeConverter, VariablesConverter};
    use crate::{
        manifest::{Variable, VariableOptions},
        quarks::SecretType,
    };

    fn variable(name: &str, variable_type: &str) -> Variable {
        Variable {
            name: name.to_owned(),
            variable_type: variable_type.to_owned(),
            options: None,
        }
    }

    #[test]
    fn simple_types() {
        let secrets = KubeConverter
            .variables(
                "nats",
                &[
                    variable("nats_password", "password"),
                    variable("ssh_key", "ssh"),
                    variable("rsa_key", "rsa"),
                ],
            )
            .unwrap();
        let summary: Vec<_> = secrets
            .iter()
            .map(|qs| (qs.spec.secret_name.as_str(), qs.spec.secret_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("var-nats-password", SecretType::Password),
                ("var-ssh-key", SecretType::Ssh),
                ("var-rsa-key", SecretType::Rsa),
            ]
        );
        assert!(secrets.iter().all(|qs| qs.metadata.owner_references.is_none()));
        assert_eq!(
            secrets[0].metadata.labels.as_ref().unwrap()["quarks.cloudfoundry.org/deployment-name"],
            "nats"
        );
    }

    #[test]
    fn certificate_references_its_ca() {
        let mut cert = variable("nats_cert", "certificate");
        cert.options = Some(VariableOptions {
            common_name: Some("nats.service.cf.internal".to_owned()),
            alternative_names: vec!["nats".to_owned()],
            is_ca: false,
            ca: Some("nats_ca".to_owned()),
        });
        let secrets = KubeConverter.variables("nats", &[cert]).unwrap();
        let request = secrets[0]
            .spec
            .request
            .as_ref()
            .and_then(|request| request.certificate.as_ref())
            .unwrap();
        assert_eq!(request.common_name.as_deref(), Some("nats.service.cf.internal"));
        let ca_ref = request.ca_ref.as_ref().unwrap();
        assert_eq!((ca_ref.name.as_str(), ca_ref.key.as_str()), ("var-nats-ca", "certificate"));
        let ca_key_ref = request.ca_key_ref.as_ref().unwrap();
        assert_eq!(
            (ca_key_ref.name.as_str(), ca_key_ref.key.as_str()),
            ("var-nats-ca", "private_key")
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = KubeConverter
            .variables("nats", &[variable("blob", "blob")])
            .unwrap_err();
        expect!["variable 'blob' has unsupported type 'blob'"].assert_eq(&err.to_string());
    }

    #[test]
    fn colliding_secret_names_are_an_error() {
        let err = KubeConverter
            .variables(
                "nats",
                &[
                    variable("nats_password", "password"),
                    variable("nats-password", "password"),
                ],
            )
            .unwrap_err();
        expect!["variables 'nats_password' and 'nats-password' both map to secret 'var-nats-password'"]
            .assert_eq(&err.to_string());
    }
}
