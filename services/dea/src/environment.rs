//! Environment block handed to launched instances.
//!
//! Values are shell words: the launcher exports them verbatim, so values the
//! agent generates are single-quoted here, runtime values are passed as the
//! operator wrote them, and user values are double-quoted unless they already
//! form one quoted word. User entries whose name is not a shell identifier
//! are dropped.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::model::InstanceRecord;

/// Quotes `value` as a single shell word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Wraps a user value in double quotes unless it is already one quoted
/// word. Anything else, unbalanced quotes included, is escaped.
fn quote_user_value(value: &str) -> String {
    if is_quoted_word(value) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// `'...'` or `"..."` with no quote of the same kind inside.
fn is_quoted_word(value: &str) -> bool {
    let Some(quote) = value.chars().next().filter(|c| *c == '\'' || *c == '"') else {
        return false;
    };
    value.len() >= 2
        && value.ends_with(quote)
        && !value[1..value.len() - 1].contains(quote)
}

/// Whether `key` can be exported by a POSIX shell.
fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `VCAP_APPLICATION` document.
pub fn application_json(record: &InstanceRecord, host: &str) -> Value {
    json!({
        "instance_id": record.instance_id,
        "instance_index": record.instance_index,
        "name": record.name,
        "uris": record.uris,
        "users": record.users,
        "version": record.version,
        "start": record.start,
        "runtime": record.runtime,
        "state_timestamp": record.state_timestamp,
        "port": record.port,
        "host": host,
        "limits": {
            "fds": record.fds_quota,
            "mem": record.mem_quota,
            "disk": record.disk_quota,
        },
    })
}

/// `VCAP_SERVICES` document: bindings grouped by service label.
pub fn services_json(record: &InstanceRecord) -> Value {
    let mut by_label: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for service in &record.services {
        by_label
            .entry(service.label.as_str())
            .or_default()
            .push(serde_json::to_value(service).unwrap_or(Value::Null));
    }
    json!(by_label)
}

/// Builds the full environment of an instance.
pub fn instance_environment(
    record: &InstanceRecord,
    host: &str,
    runtime: Option<&RuntimeConfig>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut system = |key: &str, value: String| env.push((key.to_string(), shell_quote(&value)));

    system("HOME", record.dir.display().to_string());
    system("VCAP_APPLICATION", application_json(record, host).to_string());
    system("VCAP_SERVICES", services_json(record).to_string());
    system("VCAP_APP_HOST", host.to_string());
    system("VCAP_APP_PORT", record.port.to_string());

    let debug = record.debug_ip.as_ref().zip(record.debug_port);
    if let Some((ip, port)) = debug {
        system("VCAP_DEBUG_IP", ip.clone());
        system("VCAP_DEBUG_PORT", port.to_string());
    }

    // Legacy names kept for older applications.
    system("VMC_APP_INSTANCE", serde_json::to_string(record).unwrap_or_default());
    system("VMC_APP_NAME", record.name.clone());
    system("VMC_APP_ID", record.instance_id.to_string());
    system("VMC_APP_VERSION", record.version.clone());
    system("VMC_APP_HOST", host.to_string());
    system("VMC_APP_PORT", record.port.to_string());

    if let Some(runtime) = runtime {
        if debug.is_some() {
            let mode = record.debug_mode.as_deref().unwrap_or_default();
            if let Some(debug_env) = runtime.debug_env.get(mode) {
                debug!(log_id = %record.log_id, mode, "Adding debugger environment");
                env.extend(debug_env.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        env.extend(runtime.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    for entry in &record.environment_variables {
        match entry.split_once('=') {
            Some((key, value)) if is_env_name(key) => {
                env.push((key.to_string(), quote_user_value(value)));
            }
            _ => debug!(log_id = %record.log_id, entry = %entry, "Skipping malformed user env entry"),
        }
    }
    env
}
