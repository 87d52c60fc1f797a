//! Protocol-specific export provisioning and teardown. Creation is
//! read-before-write so a retried RPC completes whatever prefix a failed
//! one left behind; teardown tolerates NotFound at every step.

use nasapi::{ApiClient, ApiError, Dataset};

/// Connection coordinates of an NVMe-oF export, returned to the CO in the
/// volume context.
pub(crate) struct NvmeofExport {
    pub nqn: String,
    pub transport: String,
    pub port: String,
}

/// NQN of the dedicated subsystem of a volume, when the storage class does
/// not supply one.
pub(crate) fn generate_nqn(volume_name: &str) -> String {
    format!("nqn.2011-06.com.zetastor:{volume_name}")
}

pub(crate) fn mountpoint_of(dataset: &Dataset) -> String {
    dataset
        .mountpoint
        .clone()
        .filter(|mountpoint| !mountpoint.is_empty())
        .unwrap_or_else(|| format!("/mnt/{}", dataset.name))
}

/// `/mnt/tank/k8s/vol` -> `tank/k8s/vol`.
pub(crate) fn mountpoint_to_dataset(path: &str) -> Option<&str> {
    path.strip_prefix("/mnt/")
}

fn tolerate_not_found(result: Result<(), ApiError>) -> Result<(), ApiError> {
    match result {
        Err(error) if error.is_not_found() => Ok(()),
        other => other,
    }
}

pub(crate) async fn ensure_nfs_share(
    client: &ApiClient,
    dataset: &Dataset,
) -> Result<String, ApiError> {
    let path = mountpoint_of(dataset);
    let existing = client.nfs_share_query_by_path(&path).await?;
    if existing.is_empty() {
        match client.nfs_share_create(&path).await {
            Ok(share) => info!("created NFS share {} at {}", share.id, path),
            Err(error) if error.is_conflict() => {
                debug!("NFS share at {} appeared concurrently", path)
            }
            Err(error) => return Err(error),
        }
    } else {
        debug!("NFS share at {} already exists", path);
    }
    Ok(path)
}

pub(crate) async fn teardown_nfs_share(
    client: &ApiClient,
    dataset_name: &str,
) -> Result<(), ApiError> {
    let path = format!("/mnt/{dataset_name}");
    for share in client.nfs_share_query_by_path(&path).await? {
        tolerate_not_found(client.nfs_share_delete(share.id).await)?;
        info!("removed NFS share {} at {}", share.id, path);
    }
    Ok(())
}

/// Create (or complete) the dedicated subsystem of a volume: subsystem,
/// its single namespace (NSID 1) and a binding on every listener port.
pub(crate) async fn ensure_nvmeof_export(
    client: &ApiClient,
    dataset_name: &str,
    volume_name: &str,
    nqn: &str,
) -> Result<NvmeofExport, ApiError> {
    let subsys = match client
        .nvmet_subsys_query_by_nqn(nqn)
        .await?
        .into_iter()
        .next()
    {
        Some(subsys) => subsys,
        None => match client.nvmet_subsys_create(volume_name, nqn).await {
            Ok(subsys) => {
                info!("created NVMe-oF subsystem {} ({})", subsys.id, nqn);
                subsys
            }
            Err(error) if error.is_conflict() => client
                .nvmet_subsys_query_by_nqn(nqn)
                .await?
                .into_iter()
                .next()
                .ok_or(error)?,
            Err(error) => return Err(error),
        },
    };

    let device_path = format!("zvol/{dataset_name}");
    let namespaces = client.nvmet_namespace_query_by_subsys(subsys.id).await?;
    if !namespaces
        .iter()
        .any(|namespace| namespace.device_path == device_path)
    {
        match client
            .nvmet_namespace_create(subsys.id, &device_path)
            .await
        {
            Ok(namespace) => info!(
                "created namespace {} ({}) in subsystem {}",
                namespace.id, device_path, subsys.id
            ),
            Err(error) if error.is_conflict() => {}
            Err(error) => return Err(error),
        }
    }

    let ports = client.nvmet_port_query().await?;
    if ports.is_empty() {
        return Err(ApiError::Unknown {
            method: "nvmet.port.query".into(),
            detail: "the appliance has no NVMe-oF listener ports configured".into(),
        });
    }
    let bound = client.nvmet_port_subsys_query_by_subsys(subsys.id).await?;
    for port in &ports {
        if bound.iter().any(|binding| binding.port.id == port.id) {
            continue;
        }
        match client.nvmet_port_subsys_create(port.id, subsys.id).await {
            Ok(_) => debug!("bound subsystem {} to port {}", subsys.id, port.id),
            Err(error) if error.is_conflict() => {}
            Err(error) => return Err(error),
        }
    }

    let first = &ports[0];
    Ok(NvmeofExport {
        nqn: nqn.to_string(),
        transport: first.transport(),
        port: first.service_id(),
    })
}

/// Tear the subsystem down: port bindings, namespace, subsystem, in that
/// order. The subsystem is located by NQN when known, otherwise through
/// the namespace pointing at the volume's ZVOL.
pub(crate) async fn teardown_nvmeof_export(
    client: &ApiClient,
    dataset_name: &str,
    nqn: Option<&str>,
) -> Result<(), ApiError> {
    let mut subsys_id = match nqn {
        Some(nqn) => client
            .nvmet_subsys_query_by_nqn(nqn)
            .await?
            .into_iter()
            .next()
            .map(|subsys| subsys.id),
        None => None,
    };
    if subsys_id.is_none() {
        let device_path = format!("zvol/{dataset_name}");
        subsys_id = client
            .nvmet_namespace_query()
            .await?
            .into_iter()
            .find(|namespace| namespace.device_path == device_path)
            .map(|namespace| namespace.subsys.id);
    }
    let Some(subsys_id) = subsys_id else {
        debug!("no NVMe-oF subsystem to tear down for {}", dataset_name);
        return Ok(());
    };

    for binding in client.nvmet_port_subsys_query_by_subsys(subsys_id).await? {
        tolerate_not_found(client.nvmet_port_subsys_delete(binding.id).await)?;
    }
    for namespace in client.nvmet_namespace_query_by_subsys(subsys_id).await? {
        tolerate_not_found(client.nvmet_namespace_delete(namespace.id).await)?;
    }
    tolerate_not_found(client.nvmet_subsys_delete(subsys_id).await)?;
    info!("removed NVMe-oF subsystem {} of {}", subsys_id, dataset_name);
    Ok(())
}

/// Create (or complete) the iSCSI export: extent backed by the ZVOL, a
/// target, and the map joining them, then reload the service.
pub(crate) async fn ensure_iscsi_export(
    client: &ApiClient,
    dataset_name: &str,
    volume_name: &str,
) -> Result<(), ApiError> {
    let disk = format!("zvol/{dataset_name}");
    let extent = match client
        .iscsi_extent_query_by_name(volume_name)
        .await?
        .into_iter()
        .next()
    {
        Some(extent) => extent,
        None => {
            let extent = client.iscsi_extent_create(volume_name, &disk).await?;
            info!("created iSCSI extent {} ({})", extent.id, disk);
            extent
        }
    };

    let target = match client
        .iscsi_target_query_by_name(volume_name)
        .await?
        .into_iter()
        .next()
    {
        Some(target) => target,
        None => {
            let target = client.iscsi_target_create(volume_name).await?;
            info!("created iSCSI target {} ({})", target.id, volume_name);
            target
        }
    };

    let maps = client.iscsi_targetextent_query_by_target(target.id).await?;
    if !maps.iter().any(|map| map.extent == extent.id) {
        match client.iscsi_targetextent_create(target.id, extent.id).await {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {}
            Err(error) => return Err(error),
        }
    }

    client.iscsi_service_reload().await?;
    Ok(())
}

pub(crate) async fn teardown_iscsi_export(
    client: &ApiClient,
    volume_name: &str,
) -> Result<(), ApiError> {
    if let Some(target) = client
        .iscsi_target_query_by_name(volume_name)
        .await?
        .into_iter()
        .next()
    {
        for map in client.iscsi_targetextent_query_by_target(target.id).await? {
            tolerate_not_found(client.iscsi_targetextent_delete(map.id).await)?;
        }
        tolerate_not_found(client.iscsi_target_delete(target.id).await)?;
    }
    if let Some(extent) = client
        .iscsi_extent_query_by_name(volume_name)
        .await?
        .into_iter()
        .next()
    {
        tolerate_not_found(client.iscsi_extent_delete(extent.id).await)?;
    }
    if let Err(error) = client.iscsi_service_reload().await {
        warn!("iSCSI service reload after teardown failed: {}", error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nqn_generation_is_per_volume() {
        assert_eq!(
            generate_nqn("pvc-abc"),
            "nqn.2011-06.com.zetastor:pvc-abc"
        );
    }

    #[test]
    fn mountpoint_round_trip() {
        assert_eq!(
            mountpoint_to_dataset("/mnt/tank/k8s/pvc-abc"),
            Some("tank/k8s/pvc-abc")
        );
        assert_eq!(mountpoint_to_dataset("/srv/elsewhere"), None);
    }
}
