//! BatchSandbox manifest construction (C7), including the pool-mode
//! POSIX shell-quoting that must be injection-safe (Testable Property #5).

use crate::model::ImageRef;
use crate::provider::CreateWorkloadParams;
use serde_json::{json, Value};

pub const EXECD_INSTALL_PATH: &str = "/opt/opensandbox/bin/execd";
pub const BOOTSTRAP_PATH: &str = "/opt/opensandbox/bin/bootstrap.sh";
const SHARED_VOLUME_NAME: &str = "opensandbox-bin";

/// POSIX single-quote one shell word: wrap in `'...'`, escaping embedded
/// single quotes as `'\''`. Equivalent to Python's `shlex.quote`.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_-+=:,./".contains(c))
    {
        return word.to_string();
    }
    let escaped = word.replace('\'', "'\\''");
    format!("'{escaped}'")
}

fn shell_quote_join(words: &[String]) -> String {
    words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

/// Build `spec.taskTemplate` for pool mode: the entrypoint is shell-quoted
/// and embedded in a `/bin/sh -c` invocation of the bootstrap script.
pub fn build_task_template(entrypoint: &[String], env: &std::collections::HashMap<String, String>) -> Value {
    let quoted = shell_quote_join(entrypoint);
    let env_list: Vec<Value> = env
        .iter()
        .map(|(k, v)| json!({"name": k, "value": v}))
        .collect();

    json!({
        "spec": {
            "process": {
                "command": ["/bin/sh", "-c", format!("{BOOTSTRAP_PATH} {quoted} &")],
                "env": env_list,
            }
        }
    })
}

fn execd_init_container(execd_image: &str) -> Value {
    json!({
        "name": "opensandbox-execd-install",
        "image": execd_image,
        "command": ["/bin/sh", "-c", format!(
            "cp /execd {EXECD_INSTALL_PATH} && cp /bootstrap.sh {BOOTSTRAP_PATH} && chmod +x {EXECD_INSTALL_PATH} {BOOTSTRAP_PATH}"
        )],
        "volumeMounts": [{"name": SHARED_VOLUME_NAME, "mountPath": "/opt/opensandbox/bin"}],
    })
}

fn resource_requirements(resource_limits: &std::collections::HashMap<String, String>) -> Value {
    let mut limits = serde_json::Map::new();
    if let Some(cpu) = resource_limits.get("cpu") {
        limits.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(mem) = resource_limits.get("memory") {
        limits.insert("memory".to_string(), json!(mem));
    }
    // Requests mirror limits so the pod is Guaranteed QoS.
    json!({ "limits": limits, "requests": limits })
}

fn main_container(image: &ImageRef, entrypoint: &[String], env: &std::collections::HashMap<String, String>, resource_limits: &std::collections::HashMap<String, String>) -> Value {
    let mut env_list: Vec<Value> = env
        .iter()
        .map(|(k, v)| json!({"name": k, "value": v}))
        .collect();
    env_list.push(json!({"name": "EXECD", "value": EXECD_INSTALL_PATH}));

    let mut command = vec![BOOTSTRAP_PATH.to_string()];
    command.extend(entrypoint.iter().cloned());

    json!({
        "name": "sandbox",
        "image": image.uri,
        "command": command,
        "env": env_list,
        "resources": resource_requirements(resource_limits),
        "volumeMounts": [{"name": SHARED_VOLUME_NAME, "mountPath": "/opt/opensandbox/bin"}],
    })
}

fn volumes(params: &CreateWorkloadParams) -> Vec<Value> {
    let mut volumes = vec![json!({"name": SHARED_VOLUME_NAME, "emptyDir": {}})];
    for (i, mount) in params.volume_mounts.iter().enumerate() {
        volumes.push(json!({
            "name": format!("host-mount-{i}"),
            "hostPath": {"path": mount.host_path},
        }));
    }
    volumes
}

/// Build the runtime-generated essentials of a template-mode manifest.
/// This is deep-merged with an optional user template: the user template
/// supplies defaults, these runtime fields always override.
pub fn build_template_manifest(params: &CreateWorkloadParams) -> Value {
    json!({
        "replicas": 1,
        "expireTime": params.expires_at.to_rfc3339(),
        "template": {
            "spec": {
                "initContainers": [execd_init_container(&params.execd_image)],
                "containers": [main_container(&params.image, &params.entrypoint, &params.env, &params.resource_limits)],
                "volumes": volumes(params),
            }
        }
    })
}

/// Build a pool-mode manifest: omits `template` entirely.
pub fn build_pool_manifest(params: &CreateWorkloadParams, pool_ref: &str) -> Value {
    json!({
        "poolRef": pool_ref,
        "expireTime": params.expires_at.to_rfc3339(),
        "taskTemplate": build_task_template(&params.entrypoint, &params.env),
    })
}

/// Deep-merge `runtime` over `base`: runtime fields take precedence at
/// every level; base supplies anything runtime doesn't specify.
pub fn deep_merge(base: Value, runtime: Value) -> Value {
    match (base, runtime) {
        (Value::Object(mut base_map), Value::Object(runtime_map)) => {
            for (k, v) in runtime_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            Value::Object(base_map)
        }
        (_, runtime) => runtime,
    }
}
