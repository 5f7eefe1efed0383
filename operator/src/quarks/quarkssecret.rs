use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Request to generate a secret, e.g. a password or a certificate.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "quarks.cloudfoundry.org",
    version = "v1alpha1",
    kind = "QuarksSecret",
    plural = "quarkssecrets",
    shortname = "qsec",
    status = "QuarksSecretStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct QuarksSecretSpec {
    /// Type of secret to generate.
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    /// Name of the generated secret.
    pub secret_name: String,
    /// Additional parameters for the generator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
}

/// Kinds of secrets the generator can produce.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    /// Random password.
    #[default]
    Password,
    /// X.509 certificate and key.
    Certificate,
    /// SSH key pair.
    Ssh,
    /// RSA key pair.
    Rsa,
}

/// Generator parameters.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Parameters for certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRequest>,
}

/// Parameters for a certificate.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    /// Common name of the certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// Subject alternative names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,
    /// Whether the certificate is a CA.
    #[serde(default)]
    pub is_ca: bool,
    /// Key of the CA certificate in the CA secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_ref: Option<SecretReference>,
    /// Key of the CA private key in the CA secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_ref: Option<SecretReference>,
}

/// Reference to a key of a secret.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct SecretReference {
    /// Name of the secret.
    pub name: String,
    /// Key within the secret.
    pub key: String,
}

/// Status of a QuarksSecret.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarksSecretStatus {
    /// Whether the secret has been generated from the current spec.
    /// Resetting it to false makes the generator run again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<bool>,
}
