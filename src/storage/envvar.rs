//! Environment variables handed to the registry workload
//!
//! Inline values are YAML scalar encoded so the registry decodes them with
//! the intended type: the string `"10"` is rendered as `'10'` and never
//! becomes the integer `10`.

use crate::error::Result;
use k8s_openapi::api::core::v1::{EnvVar as KubeEnvVar, EnvVarSource, SecretKeySelector};
use serde::Serialize;

/// Where a variable takes its value from
#[derive(Debug, Clone, PartialEq)]
pub enum EnvSource {
    Value(serde_yaml::Value),
    Secret { name: String, key: String },
}

/// One environment variable descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub source: EnvSource,
}

impl EnvVar {
    pub fn value(name: impl Into<String>, value: impl Serialize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            source: EnvSource::Value(serde_yaml::to_value(value)?),
        })
    }

    pub fn secret(name: impl Into<String>, secret: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: EnvSource::Secret {
                name: secret.into(),
                key: key.into(),
            },
        }
    }

    /// Render as a Kubernetes container variable
    pub fn to_kube(&self) -> Result<KubeEnvVar> {
        match &self.source {
            EnvSource::Value(value) => Ok(KubeEnvVar {
                name: self.name.clone(),
                value: Some(encode_scalar(value)?),
                value_from: None,
            }),
            EnvSource::Secret { name, key } => Ok(KubeEnvVar {
                name: self.name.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(name.clone()),
                        key: key.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            }),
        }
    }
}

fn encode_scalar(value: &serde_yaml::Value) -> Result<String> {
    let encoded = serde_yaml::to_string(value)?;
    Ok(encoded.trim_end_matches('\n').to_string())
}

/// Ordered list of variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvVarList(Vec<EnvVar>);

impl EnvVarList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_value(&mut self, name: &str, value: impl Serialize) -> Result<()> {
        self.0.push(EnvVar::value(name, value)?);
        Ok(())
    }

    pub fn push_secret(&mut self, name: &str, secret: &str, key: &str) {
        self.0.push(EnvVar::secret(name, secret, key));
    }

    pub fn get(&self, name: &str) -> Option<&EnvVar> {
        self.0.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_kube(&self) -> Result<Vec<KubeEnvVar>> {
        self.0.iter().map(EnvVar::to_kube).collect()
    }
}

impl IntoIterator for EnvVarList {
    type Item = EnvVar;
    type IntoIter = std::vec::IntoIter<EnvVar>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
