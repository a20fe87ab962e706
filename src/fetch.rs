//! Inventory fetcher: enumerate domains on every configured endpoint.

use virt::connect::Connect;
use virt::error as virt_error;
use vmctl_worker::libvirt::power_state_from_raw;

use crate::config::{EndpointConfig, SystemConfig};
use crate::error::VmctlError;
use crate::inventory::{Inventory, Record};

/// List every domain (active and inactive) on one endpoint.
pub fn fetch_endpoint(endpoint: &EndpointConfig) -> Result<Vec<Record>, VmctlError> {
    virt_error::clear_error_callback();

    let mut conn = Connect::open(Some(endpoint.uri.as_str())).map_err(|e| VmctlError::Libvirt {
        message: format!("failed to connect to {}: {e}", endpoint.uri),
        hint: format!("check that '{}' is reachable and you are authorized", endpoint.uri),
    })?;

    let domains = conn.list_all_domains(0);
    let result = match domains {
        Ok(domains) => {
            let mut records = Vec::with_capacity(domains.len());
            for dom in &domains {
                let Ok(name) = dom.get_name() else {
                    continue;
                };
                let status = match dom.get_info() {
                    Ok(info) => power_state_from_raw(info.state).to_string(),
                    Err(_) => "unknown".to_string(),
                };
                records.push(Record::new(&name, &status, &endpoint.name, endpoint.group()));
            }
            Ok(records)
        }
        Err(e) => Err(VmctlError::Libvirt {
            message: format!("failed to list domains on {}: {e}", endpoint.uri),
            hint: "the connection may lack permission to list domains".into(),
        }),
    };

    conn.close().ok();
    result
}

/// Fetch all endpoints with `fetch`. Unreachable endpoints are skipped;
/// the refresh fails only when every endpoint fails.
pub fn collect<F>(endpoints: &[EndpointConfig], mut fetch: F) -> Result<Inventory, VmctlError>
where
    F: FnMut(&EndpointConfig) -> Result<Vec<Record>, VmctlError>,
{
    if endpoints.is_empty() {
        return Err(VmctlError::Validation {
            message: "no endpoints configured".into(),
        });
    }

    let mut records = Vec::new();
    let mut failures = Vec::new();
    for endpoint in endpoints {
        match fetch(endpoint) {
            Ok(mut found) => {
                tracing::info!(endpoint = %endpoint.name, count = found.len(), "endpoint fetched");
                records.append(&mut found);
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint.name, error = %e, "skipping unreachable endpoint");
                failures.push(format!("{}: {e}", endpoint.name));
            }
        }
    }

    if failures.len() == endpoints.len() {
        return Err(VmctlError::Libvirt {
            message: format!("every endpoint failed ({})", failures.join("; ")),
            hint: "check the endpoint URIs in the config".into(),
        });
    }
    Ok(Inventory::from_records(records))
}

/// Rebuild the inventory from libvirt and write the cache.
pub async fn refresh(system: &SystemConfig) -> Result<Inventory, VmctlError> {
    let endpoints = system.config.endpoints.clone();
    let inventory = tokio::task::spawn_blocking(move || collect(&endpoints, fetch_endpoint))
        .await
        .map_err(|e| VmctlError::Libvirt {
            message: format!("fetch task failed: {e}"),
            hint: "re-run with -v for details".into(),
        })??;

    inventory.save(&system.cache_path())?;
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            uri: format!("qemu+ssh://root@{name}/system"),
            group: String::new(),
        }
    }

    #[test]
    fn unreachable_endpoints_are_skipped() {
        let endpoints = [endpoint("lab1"), endpoint("lab2")];
        let inv = collect(&endpoints, |ep| {
            if ep.name == "lab1" {
                Err(VmctlError::Libvirt {
                    message: "connection refused".into(),
                    hint: String::new(),
                })
            } else {
                Ok(vec![Record::new("web01", "running", &ep.name, ep.group())])
            }
        })
        .unwrap();
        assert_eq!(inv.len(), 1);
        assert_eq!(inv.records()[0].location, "lab2");
        assert_eq!(inv.records()[0].group, "lab2");
    }

    #[test]
    fn all_endpoints_failing_is_an_error() {
        let endpoints = [endpoint("lab1"), endpoint("lab2")];
        let err = collect(&endpoints, |_| {
            Err(VmctlError::Libvirt {
                message: "connection refused".into(),
                hint: String::new(),
            })
        })
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("lab1") && text.contains("lab2"), "{text}");
    }

    #[test]
    fn no_endpoints_is_validation_error() {
        let err = collect(&[], |_| Ok(Vec::new())).unwrap_err();
        assert!(matches!(err, VmctlError::Validation { .. }));
    }
}
