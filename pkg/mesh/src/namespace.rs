use tracing::info;

const NAMESPACE_ENV: &str = "PUBLISH_NAMESPACE";
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Resolve the namespace service entries are published into: the flag, then
/// `PUBLISH_NAMESPACE`, then the pod's service-account namespace, then
/// `"default"`.
pub fn publish_namespace(flag: Option<&str>) -> String {
    if let Some(ns) = flag.filter(|ns| !ns.is_empty()) {
        info!("using namespace flag to publish service entries into {:?}", ns);
        return ns.to_string();
    }
    if let Ok(ns) = std::env::var(NAMESPACE_ENV) {
        if !ns.is_empty() {
            info!(
                "using {} to publish service entries into {:?}",
                NAMESPACE_ENV, ns
            );
            return ns;
        }
    }
    if let Ok(data) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE) {
        let ns = data.trim();
        if !ns.is_empty() {
            info!(
                "using the pod's service-account namespace to publish service entries into {:?}",
                ns
            );
            return ns.to_string();
        }
    }
    info!("couldn't determine a namespace, falling back to \"default\"");
    "default".to_string()
}
