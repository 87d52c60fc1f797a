//! Node service: realise a volume as a usable block device or mounted
//! filesystem on this host. NVMe-oF attach is the involved path; NFS is a
//! plain mount. Every RPC is idempotent per (volume, staging path).

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use nasapi::ApiClient;
use tokio::sync::Semaphore;
use tonic::{Code, Request, Response, Status};

use crate::{
    csi::{
        node_server, node_service_capability,
        volume_capability::{self, access_mode::Mode},
        NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
        NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
        NodePublishVolumeRequest, NodePublishVolumeResponse, NodeServiceCapability,
        NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
        NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
        VolumeCapability,
    },
    dev,
    dev::{
        nfs,
        nvmf::{self, DeviceLookup, NvmfAttach, NvmfParams},
    },
    format, ids, mount,
};

/// Pause after disconnecting a stale session before reconnecting.
const STALE_DISCONNECT_DELAY: Duration = Duration::from_secs(2);
/// Metadata stabilisation pause after the cache flush.
const METADATA_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Extra stabilisation for volumes cloned from snapshots.
const CLONE_SETTLE_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Node {
    pub node_name: String,
    pub client: ApiClient,
    /// Bounds concurrent nvme connect cycles; the kernel serialises
    /// subsystem registration and collapses under a stampede.
    pub attach_semaphore: Arc<Semaphore>,
    pub enable_discovery: bool,
}

/// Sets the cancellation flag when the owning RPC future is dropped, so the
/// detached attach task stops at its next cycle boundary.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

// Determine if the given access mode in conjunction with the ro flag makes
// sense. Access mode is advisory for the CO when attaching volumes to pods;
// it does not itself control whether the mount is rw or ro.
fn check_access_mode(
    volume_id: &str,
    access_mode: &Option<volume_capability::AccessMode>,
    readonly: bool,
) -> Result<(), String> {
    let rdonly_access_mode = match access_mode {
        Some(mode) => match Mode::try_from(mode.mode) {
            Ok(Mode::SingleNodeWriter | Mode::SingleNodeSingleWriter) => false,
            Ok(Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly) => true,
            Ok(Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter) => false,
            _ => {
                return Err(format!(
                    "unsupported access mode {} for {volume_id}",
                    mode.mode
                ))
            }
        },
        None => return Err(format!("missing access mode for {volume_id}")),
    };
    if !readonly && rdonly_access_mode {
        Err(format!(
            "invalid combination of read-only access mode and rw mount for {volume_id}"
        ))
    } else {
        Ok(())
    }
}

fn mount_flags(capability: &VolumeCapability) -> Vec<String> {
    match &capability.access_type {
        Some(volume_capability::AccessType::Mount(mount)) => mount.mount_flags.clone(),
        _ => Vec::new(),
    }
}

fn fs_type(capability: &VolumeCapability) -> String {
    match &capability.access_type {
        Some(volume_capability::AccessType::Mount(mount)) if !mount.fs_type.is_empty() => {
            mount.fs_type.clone()
        }
        _ => "ext4".to_string(),
    }
}

impl Node {
    /// Stage an NVMe-oF volume: reuse a healthy existing connection when
    /// possible, otherwise connect under the attach semaphore.
    async fn stage_nvmf(
        &self,
        volume_id: &str,
        staging_path: &str,
        capability: &VolumeCapability,
        is_block: bool,
        context: &HashMap<String, String>,
    ) -> Result<(), Status> {
        let params = NvmfParams::from_context(context)
            .map_err(|error| Status::invalid_argument(error.message))?;
        let nqn = params.nqn.clone();
        let attach = NvmfAttach::new(params, self.enable_discovery);

        debug!(
            "staging NVMe-oF volume {} (block mode: {}): NQN={}, dataset={:?}",
            volume_id,
            is_block,
            nqn,
            context.get(ids::CONTEXT_DATASET_NAME)
        );

        // Idempotent staging: a healthy device for this NQN means a
        // previous stage attempt connected already.
        match attach.find().await {
            Ok(DeviceLookup::Healthy { device }) => {
                if let Some(controller) = nvmf::controller_of(&device) {
                    nvmf::ns_rescan(&controller).await;
                }
                if dev::verify_device_healthy(&device).await {
                    debug!("reusing healthy NVMe-oF device {} for {}", device, nqn);
                    return self
                        .stage_device(volume_id, &device, staging_path, capability, is_block, context)
                        .await;
                }
                warn!(
                    "existing NVMe device {} appears stale, disconnecting to force reconnect",
                    device
                );
                let _ = nvmf::disconnect(&nqn).await;
                tokio::time::sleep(STALE_DISCONNECT_DELAY).await;
            }
            Ok(DeviceLookup::Unhealthy { device, .. }) => {
                warn!(
                    "found stale NVMe connection for {} (unhealthy device {}), disconnecting",
                    nqn, device
                );
                let _ = nvmf::disconnect(&nqn).await;
                tokio::time::sleep(STALE_DISCONNECT_DELAY).await;
            }
            Ok(DeviceLookup::Missing) => {}
            Err(error) => debug!("device reuse probe failed: {}", error),
        }

        nvmf::check_nvme_cli()
            .await
            .map_err(|error| Status::failed_precondition(format!("nvme-cli not available: {error}")))?;

        debug!(
            "waiting for NVMe-oF attach semaphore ({} free) for NQN {}",
            self.attach_semaphore.available_permits(),
            nqn
        );
        let permit = self
            .attach_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::internal("attach semaphore closed"))?;
        debug!("acquired NVMe-oF attach semaphore for NQN {}", nqn);

        // The attach loop runs as a detached task: an RPC deadline firing
        // mid-cycle must not abort a half-registered controller. Dropping
        // this future flips the flag and the task winds down at the next
        // cycle boundary, releasing the permit.
        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(cancelled.clone());
        let task_flag = cancelled.clone();
        let attach_task = tokio::spawn(async move {
            let _permit = permit;
            attach.attach(&task_flag).await
        });

        let device = attach_task
            .await
            .map_err(|error| Status::internal(format!("attach task failed: {error}")))?
            .map_err(|error| Status::internal(error.message))?;

        self.stage_device(volume_id, &device, staging_path, capability, is_block, context)
            .await
    }

    /// Stage an attached device: bind it for raw-block volumes, or verify,
    /// format (if needed) and mount it for filesystem volumes.
    async fn stage_device(
        &self,
        volume_id: &str,
        device: &str,
        staging_path: &str,
        capability: &VolumeCapability,
        is_block: bool,
        context: &HashMap<String, String>,
    ) -> Result<(), Status> {
        if is_block {
            return stage_block(device, staging_path).await;
        }

        dev::wait_device_initialized(device)
            .await
            .map_err(|error| Status::internal(format!("device initialization timeout: {error}")))?;
        dev::flush_device_caches(device).await;
        tokio::time::sleep(METADATA_SETTLE_DELAY).await;

        let is_clone =
            context.get(ids::CONTEXT_CLONED_FROM_SNAPSHOT).map(String::as_str) == Some(ids::VALUE_TRUE);
        if is_clone {
            debug!(
                "volume {} was cloned from a snapshot, waiting {:?} for metadata to stabilise",
                volume_id, CLONE_SETTLE_DELAY
            );
            tokio::time::sleep(CLONE_SETTLE_DELAY).await;
        }

        if !Path::new(device).exists() {
            return Err(Status::unavailable(format!(
                "NVMe device {device} became unavailable before staging completed"
            )));
        }

        let actual = dev::device_size(device).await.map_err(|error| {
            if Path::new(device).exists() {
                Status::internal(format!("failed to read size of {device}: {error}"))
            } else {
                Status::unavailable(format!("device {device} became unavailable: {error}"))
            }
        })?;
        match self.expected_capacity(context).await {
            Some(expected) if expected > 0 => {
                dev::verify_size_match(actual, expected).map_err(|error| {
                    Status::failed_precondition(format!(
                        "refusing to mount {device} to prevent data corruption: {error}"
                    ))
                })?;
            }
            _ => warn!(
                "no expected capacity available for {}, skipping size verification",
                device
            ),
        }

        let fstype = fs_type(capability);
        if !format::fstype_supported(&fstype) {
            return Err(Status::invalid_argument(format!(
                "filesystem {fstype} is not supported"
            )));
        }
        let needs_format = format::needs_format(device, is_clone)
            .await
            .map_err(|error| {
                Status::internal(format!("failed to check if device needs formatting: {error}"))
            })?;
        if needs_format {
            format::format_device(device, &fstype, volume_id)
                .await
                .map_err(|error| Status::internal(format!("failed to format device: {error}")))?;
        } else {
            debug!(
                "device {} is already formatted, preserving existing filesystem",
                device
            );
        }

        std::fs::create_dir_all(staging_path).map_err(|error| {
            Status::internal(format!("failed to create staging path {staging_path}: {error}"))
        })?;
        if mount::is_mounted(staging_path)
            .await
            .map_err(|error| Status::internal(error.message))?
        {
            debug!("staging path {} is already mounted", staging_path);
            return Ok(());
        }

        let options = mount::merge_mount_options(&mount_flags(capability));
        mount::mount_device(device, staging_path, Some(&fstype), &options)
            .await
            .map_err(|error| Status::internal(format!("failed to mount device: {error}")))?;
        Ok(())
    }

    /// The declared capacity to verify the attached device against: volume
    /// context first, the appliance's ZVOL size as fallback.
    async fn expected_capacity(&self, context: &HashMap<String, String>) -> Option<u64> {
        if let Some(raw) = context.get(ids::CONTEXT_EXPECTED_CAPACITY) {
            match raw.parse::<u64>() {
                Ok(capacity) => return Some(capacity),
                Err(_) => warn!("failed to parse expectedCapacity {:?}", raw),
            }
        }
        let dataset = context.get(ids::CONTEXT_DATASET_NAME)?;
        match self.client.dataset_get(dataset).await {
            Ok(Some(dataset)) => dataset.zvol_capacity(),
            Ok(None) => None,
            Err(error) => {
                warn!("failed to query ZVOL size of {}: {}", dataset, error);
                None
            }
        }
    }
}

/// Raw-block staging: the staging path becomes a regular file with the
/// device bind-mounted onto it.
async fn stage_block(device: &str, staging_path: &str) -> Result<(), Status> {
    if mount::is_mounted(staging_path)
        .await
        .map_err(|error| Status::internal(error.message))?
    {
        debug!("block staging path {} is already bound", staging_path);
        return Ok(());
    }
    if let Some(parent) = Path::new(staging_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|error| Status::internal(format!("failed to create {parent:?}: {error}")))?;
    }
    if !Path::new(staging_path).exists() {
        std::fs::File::create(staging_path).map_err(|error| {
            Status::internal(format!("failed to create bind target {staging_path}: {error}"))
        })?;
    }
    mount::bind_mount(device, staging_path)
        .await
        .map_err(|error| Status::internal(format!("failed to bind device: {error}")))?;
    Ok(())
}

#[tonic::async_trait]
impl node_server::Node for Node {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();
        let volume_id = &msg.volume_id;
        let staging_path = &msg.staging_target_path;

        trace!("{:?}", msg);

        if volume_id.is_empty() || staging_path.is_empty() {
            return Err(Status::invalid_argument(
                "volume id and staging target path are required",
            ));
        }
        let capability = msg
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
        let is_block = matches!(
            capability.access_type,
            Some(volume_capability::AccessType::Block(_))
        );

        let context = &msg.volume_context;
        let protocol = context
            .get(ids::CONTEXT_PROTOCOL)
            .and_then(|value| ids::Protocol::parse(value))
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "volume context of {volume_id} carries no usable protocol"
                ))
            })?;

        match protocol {
            ids::Protocol::Nfs => {
                if is_block {
                    return Err(Status::invalid_argument(
                        "raw block volumes cannot be served over NFS",
                    ));
                }
                let server = context.get(ids::CONTEXT_SERVER).cloned().unwrap_or_default();
                let share = context
                    .get(ids::CONTEXT_NFS_SHARE)
                    .cloned()
                    .unwrap_or_default();
                if server.is_empty() || share.is_empty() {
                    return Err(Status::invalid_argument(
                        "server and share must be provided in volume context for NFS volumes",
                    ));
                }
                let options = mount::merge_mount_options(&mount_flags(capability));
                nfs::stage(&server, &share, staging_path, &options)
                    .await
                    .map_err(|error| {
                        Status::internal(format!("failed to stage NFS volume {volume_id}: {error}"))
                    })?;
            }
            ids::Protocol::Nvmeof => {
                self.stage_nvmf(volume_id, staging_path, capability, is_block, context)
                    .await?;
            }
            ids::Protocol::Iscsi => {
                return Err(Status::unimplemented(
                    "iSCSI attach is not supported by this node plugin",
                ));
            }
        }

        info!("staged volume {} at {}", volume_id, staging_path);
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    /// Unstage is best effort: every "already gone" condition is tolerated
    /// so deletion can always drain.
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();
        let volume_id = &msg.volume_id;
        let staging_path = &msg.staging_target_path;

        debug!("unstaging volume {} at {}", volume_id, staging_path);

        if staging_path.is_empty() {
            return Err(Status::invalid_argument("staging target path is required"));
        }

        // Derive the NQN while the mount still exists; the unstage request
        // carries no volume context.
        let nqn = match nvmf::derive_nqn_from_staging_path(staging_path).await {
            Ok(nqn) => Some(nqn),
            Err(error) => {
                debug!(
                    "no NVMe subsystem derivable from {}: {}",
                    staging_path, error
                );
                None
            }
        };

        if mount::is_mounted(staging_path)
            .await
            .map_err(|error| Status::internal(error.message))?
        {
            mount::unmount(staging_path)
                .await
                .map_err(|error| Status::internal(format!("failed to unmount staging path: {error}")))?;
        }

        match nqn {
            Some(nqn) => {
                debug!("disconnecting NVMe-oF subsystem {} for {}", nqn, volume_id);
                if let Err(error) = nvmf::disconnect(&nqn).await {
                    warn!("failed to disconnect NVMe-oF device (continuing): {}", error);
                }
            }
            None => debug!("volume {} has no NVMe-oF session to tear down", volume_id),
        }

        info!("unstaged volume {} at {}", volume_id, staging_path);
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        let volume_id = &msg.volume_id;
        let staging_path = &msg.staging_target_path;
        let target_path = &msg.target_path;

        trace!("{:?}", msg);

        if staging_path.is_empty() || target_path.is_empty() {
            return Err(Status::invalid_argument(format!(
                "invalid staging or target path for {volume_id}"
            )));
        }
        let capability = msg
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument(format!("missing access type for {volume_id}")))?;
        if let Err(reason) = check_access_mode(volume_id, &capability.access_mode, msg.readonly) {
            return Err(Status::invalid_argument(reason));
        }

        if !mount::is_mounted(staging_path)
            .await
            .map_err(|error| Status::internal(error.message))?
        {
            return Err(Status::failed_precondition(format!(
                "no mount at {staging_path} for volume {volume_id} (hint: volume unstaged?)"
            )));
        }

        if mount::is_mounted(target_path)
            .await
            .map_err(|error| Status::internal(error.message))?
        {
            debug!("volume {} already published at {}", volume_id, target_path);
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        match &capability.access_type {
            Some(volume_capability::AccessType::Mount(_)) => {
                std::fs::create_dir_all(target_path).map_err(|error| {
                    Status::internal(format!(
                        "failed to create mountpoint {target_path} for volume {volume_id}: {error}"
                    ))
                })?;
            }
            Some(volume_capability::AccessType::Block(_)) => {
                if let Some(parent) = Path::new(target_path).parent() {
                    std::fs::create_dir_all(parent).map_err(|error| {
                        Status::internal(format!("failed to create {parent:?}: {error}"))
                    })?;
                }
                if !Path::new(target_path).exists() {
                    std::fs::File::create(target_path).map_err(|error| {
                        Status::internal(format!(
                            "failed to create bind target {target_path}: {error}"
                        ))
                    })?;
                }
            }
            None => {
                return Err(Status::invalid_argument(format!(
                    "missing access type for {volume_id}"
                )))
            }
        }

        mount::bind_mount(staging_path, target_path)
            .await
            .map_err(|error| {
                Status::internal(format!("failed to publish volume {volume_id}: {error}"))
            })?;
        if msg.readonly {
            mount::remount_readonly(target_path).await.map_err(|error| {
                Status::internal(format!(
                    "failed to make published volume {volume_id} read-only: {error}"
                ))
            })?;
        }

        info!("published volume {} at {}", volume_id, target_path);
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        let volume_id = &msg.volume_id;
        let target_path = &msg.target_path;

        trace!("{:?}", msg);

        if mount::is_mounted(target_path)
            .await
            .map_err(|error| Status::internal(error.message))?
        {
            mount::unmount(target_path).await.map_err(|error| {
                Status::internal(format!("failed to unpublish volume {volume_id}: {error}"))
            })?;
            info!("unpublished volume {} at {}", volume_id, target_path);
        } else {
            debug!("volume {} is not published at {}", volume_id, target_path);
        }

        // best effort removal of the target so the CO can reuse the path
        let target = Path::new(target_path);
        if target.is_dir() {
            let _ = std::fs::remove_dir(target);
        } else if target.exists() {
            let _ = std::fs::remove_file(target);
        }

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let msg = request.into_inner();
        error!("unimplemented {:?}", msg);
        Err(Status::new(Code::Unimplemented, "method not implemented"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![node_service_capability::rpc::Type::StageUnstageVolume];

        debug!("NodeGetCapabilities request: {:?}", caps);

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|capability| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc {
                            r#type: capability as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        debug!("NodeGetInfo request: ID={}", self.node_name);
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_mode(mode: Mode) -> Option<volume_capability::AccessMode> {
        Some(volume_capability::AccessMode { mode: mode as i32 })
    }

    #[test]
    fn access_mode_checks() {
        assert!(check_access_mode("vol", &access_mode(Mode::SingleNodeWriter), false).is_ok());
        assert!(check_access_mode("vol", &access_mode(Mode::MultiNodeMultiWriter), false).is_ok());
        // read-only access mode with a rw mount makes no sense
        assert!(check_access_mode("vol", &access_mode(Mode::MultiNodeReaderOnly), false).is_err());
        assert!(check_access_mode("vol", &access_mode(Mode::MultiNodeReaderOnly), true).is_ok());
        assert!(check_access_mode("vol", &None, false).is_err());
    }

    #[test]
    fn fs_type_defaults_to_ext4() {
        let capability = VolumeCapability {
            access_type: Some(volume_capability::AccessType::Mount(
                volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: access_mode(Mode::SingleNodeWriter),
        };
        assert_eq!(fs_type(&capability), "ext4");

        let block = VolumeCapability {
            access_type: Some(volume_capability::AccessType::Block(
                volume_capability::BlockVolume {},
            )),
            access_mode: access_mode(Mode::SingleNodeWriter),
        };
        assert_eq!(fs_type(&block), "ext4");
    }
}
