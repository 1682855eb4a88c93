//! Translation between image environment variables and Kubernetes labels.
//!
//! Container disk images carry hints such as
//! `INSTANCETYPE_KUBEVIRT_IO_DEFAULT_PREFERENCE=fedora` in their config. The
//! controller wants them as `instancetype.kubevirt.io/default-preference`.

use std::collections::BTreeMap;

const DOMAIN: &str = "kubevirt.io";
const ENV_MARKER: &str = "KUBEVIRT_IO_";

/// Labels for every `*_KUBEVIRT_IO_*=value` entry of `envs`. Other entries
/// are ignored; later duplicates win.
pub fn envs_to_labels<S: AsRef<str>>(envs: &[S]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for env in envs {
        let Some((name, value)) = env.as_ref().split_once('=') else {
            continue;
        };
        if let Some(key) = env_name_to_label(name) {
            labels.insert(key, value.to_string());
        }
    }
    labels
}

/// `NAME=value` entries for every label under the `kubevirt.io` domain.
pub fn labels_to_envs(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .filter_map(|(key, value)| Some(format!("{}={}", label_to_env_name(key)?, value)))
        .collect()
}

fn env_name_to_label(name: &str) -> Option<String> {
    let (prefix, suffix) = if let Some(rest) = name.strip_prefix(ENV_MARKER) {
        ("", rest)
    } else {
        let idx = name.find(&format!("_{}", ENV_MARKER))?;
        (&name[..idx], &name[idx + ENV_MARKER.len() + 1..])
    };
    if suffix.is_empty() {
        return None;
    }
    let domain = if prefix.is_empty() {
        DOMAIN.to_string()
    } else {
        format!("{}.{}", prefix.to_ascii_lowercase().replace('_', "."), DOMAIN)
    };
    Some(format!(
        "{}/{}",
        domain,
        suffix.to_ascii_lowercase().replace('_', "-")
    ))
}

fn label_to_env_name(key: &str) -> Option<String> {
    let (domain, name) = key.split_once('/')?;
    let prefix = if domain == DOMAIN {
        ""
    } else {
        domain.strip_suffix(&format!(".{}", DOMAIN))?
    };
    if name.is_empty() {
        return None;
    }
    let name = name.to_ascii_uppercase().replace('-', "_");
    if prefix.is_empty() {
        return Some(format!("{}{}", ENV_MARKER, name));
    }
    Some(format!(
        "{}_{}{}",
        prefix.to_ascii_uppercase().replace('.', "_"),
        ENV_MARKER,
        name
    ))
}
