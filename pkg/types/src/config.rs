use serde::{Deserialize, Serialize};

/// Bridge configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// id: meshbridge-prod
/// namespace: istio-system
/// aws-region: us-east-1
/// consul-endpoint: http://consul.internal:8500
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfigFile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default, alias = "kube-config")]
    pub kube_config: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, alias = "aws-region")]
    pub aws_region: Option<String>,
    #[serde(default, alias = "aws-access-key-id")]
    pub aws_access_key_id: Option<String>,
    #[serde(default, alias = "aws-secret-access-key")]
    pub aws_secret_access_key: Option<String>,
    #[serde(default, alias = "consul-endpoint")]
    pub consul_endpoint: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
