//! Controller service: translate CSI controller RPCs into typed appliance
//! calls. Every RPC is idempotent; a retried request observes whatever
//! prefix of appliance mutations the previous attempt completed and
//! finishes the remainder.

use std::collections::HashMap;

use nasapi::{property, ApiClient, Dataset, DatasetCreateParams, DatasetType};
use tonic::{Request, Response, Status};

use crate::{
    clone::{clone_info_from_properties, CloneInfo},
    csi::{
        controller_server, controller_service_capability, volume_capability,
        volume_capability::access_mode::Mode, volume_content_source,
        validate_volume_capabilities_response, controller_get_volume_response, CapacityRange,
        ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
        ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
        ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
        ControllerPublishVolumeResponse, ControllerServiceCapability,
        ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
        CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
        DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetSnapshotRequest,
        GetSnapshotResponse, ListSnapshotsRequest, ListSnapshotsResponse,
        ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
        VolumeCapability, VolumeContentSource,
    },
    ids::{self, Protocol},
    provision,
};

/// Volume size when the capacity range leaves it open.
pub(crate) const DEFAULT_CAPACITY: u64 = 1 << 30;

#[derive(Clone)]
pub struct Controller {
    pub client: ApiClient,
}

/// A volume resolved to its backing dataset.
pub(crate) struct ResolvedVolume {
    pub dataset: Dataset,
    pub protocol: Protocol,
}

pub(crate) fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or("")
}

pub(crate) fn param_true(params: &HashMap<String, String>, key: &str) -> bool {
    param(params, key) == ids::VALUE_TRUE
}

/// The protocol of an existing dataset: the recorded property, falling back
/// to a guess from the dataset type for unmigrated volumes.
pub(crate) fn protocol_of(dataset: &Dataset) -> Protocol {
    dataset
        .user_property(property::PROPERTY_PROTOCOL)
        .and_then(Protocol::parse)
        .unwrap_or(match dataset.kind {
            DatasetType::Filesystem => Protocol::Nfs,
            DatasetType::Volume => Protocol::Nvmeof,
        })
}

/// Pick the provisioned size from a CSI capacity range.
pub(crate) fn capacity_from_range(range: Option<&CapacityRange>) -> Result<u64, Status> {
    let Some(range) = range else {
        return Ok(DEFAULT_CAPACITY);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(Status::invalid_argument("capacity range must not be negative"));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(Status::invalid_argument(format!(
            "required bytes {} exceed the limit of {}",
            range.required_bytes, range.limit_bytes
        )));
    }
    if range.required_bytes > 0 {
        Ok(range.required_bytes as u64)
    } else if range.limit_bytes > 0 {
        Ok(range.limit_bytes as u64)
    } else {
        Ok(DEFAULT_CAPACITY)
    }
}

/// The delete strategy requested by the storage class. Checked before any
/// provisioning side effect so a typo cannot leave a half-created volume
/// behind.
pub(crate) fn delete_strategy_param(params: &HashMap<String, String>) -> Result<&'static str, Status> {
    match param(params, ids::PARAM_DELETE_STRATEGY) {
        "" => Ok(property::DELETE_STRATEGY_DELETE),
        value if value == property::DELETE_STRATEGY_RETAIN => Ok(property::DELETE_STRATEGY_RETAIN),
        value if value == property::DELETE_STRATEGY_DELETE => Ok(property::DELETE_STRATEGY_DELETE),
        other => Err(Status::invalid_argument(format!(
            "unknown delete strategy {other:?}"
        ))),
    }
}

/// Check the requested capabilities against what the protocol can serve:
/// raw block and single-node access for the block transports, mount access
/// including multi-node for NFS.
pub(crate) fn validate_capabilities(
    protocol: Protocol,
    capabilities: &[VolumeCapability],
) -> Result<(), Status> {
    for capability in capabilities {
        match &capability.access_type {
            Some(volume_capability::AccessType::Block(_)) => {
                if protocol == Protocol::Nfs {
                    return Err(Status::invalid_argument(
                        "raw block volumes cannot be served over NFS",
                    ));
                }
            }
            Some(volume_capability::AccessType::Mount(_)) => {}
            None => return Err(Status::invalid_argument("volume capability has no access type")),
        }
        if let Some(access_mode) = &capability.access_mode {
            let mode = Mode::try_from(access_mode.mode).unwrap_or(Mode::Unknown);
            let multi_node = matches!(
                mode,
                Mode::MultiNodeReaderOnly | Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter
            );
            if multi_node && protocol != Protocol::Nfs {
                return Err(Status::invalid_argument(format!(
                    "multi-node access requires nfs, not {protocol}"
                )));
            }
        }
    }
    Ok(())
}

impl Controller {
    /// Resolve a volume id to its dataset: canonical path first, then the
    /// csi-name property search, then the legacy share/namespace/extent
    /// scan.
    pub(crate) async fn resolve_volume(
        &self,
        volume_id: &str,
    ) -> Result<Option<ResolvedVolume>, Status> {
        if ids::is_dataset_path(volume_id) {
            let dataset = self.client.dataset_get(volume_id).await.map_err(Status::from)?;
            return Ok(dataset.map(|dataset| {
                let protocol = protocol_of(&dataset);
                ResolvedVolume { dataset, protocol }
            }));
        }

        if let Some(dataset) = self
            .client
            .dataset_find_by_csi_name("", volume_id)
            .await
            .map_err(Status::from)?
        {
            let protocol = protocol_of(&dataset);
            return Ok(Some(ResolvedVolume { dataset, protocol }));
        }

        if let Some((dataset_name, protocol)) = self.discover_by_search(volume_id).await {
            if let Some(dataset) = self
                .client
                .dataset_get(&dataset_name)
                .await
                .map_err(Status::from)?
            {
                return Ok(Some(ResolvedVolume { dataset, protocol }));
            }
        }
        Ok(None)
    }

    /// Legacy fallback: locate the dataset of an unmigrated volume by
    /// scanning NFS shares, NVMe-oF namespaces and iSCSI extents.
    async fn discover_by_search(&self, volume_id: &str) -> Option<(String, Protocol)> {
        let suffix = format!("/{volume_id}");
        if let Ok(shares) = self.client.nfs_share_query_all().await {
            for share in shares {
                if share.path.ends_with(&suffix) {
                    if let Some(dataset) = provision::mountpoint_to_dataset(&share.path) {
                        return Some((dataset.to_string(), Protocol::Nfs));
                    }
                }
            }
        }
        if let Ok(namespaces) = self.client.nvmet_namespace_query().await {
            for namespace in namespaces {
                if namespace.device_path.contains(volume_id) {
                    let dataset = namespace
                        .device_path
                        .trim_start_matches("zvol/")
                        .to_string();
                    return Some((dataset, Protocol::Nvmeof));
                }
            }
        }
        if let Ok(extents) = self.client.iscsi_extent_query_all().await {
            for extent in extents {
                if let Some(disk) = &extent.disk {
                    if disk.contains(volume_id) {
                        return Some((disk.trim_start_matches("zvol/").to_string(), Protocol::Iscsi));
                    }
                }
            }
        }
        None
    }

    /// Make sure the parent dataset exists, creating it as a managed
    /// filesystem if missing.
    async fn ensure_parent_dataset(&self, parent: &str) -> Result<(), Status> {
        if self
            .client
            .dataset_get(parent)
            .await
            .map_err(Status::from)?
            .is_some()
        {
            return Ok(());
        }
        info!("creating parent dataset {}", parent);
        match self
            .client
            .dataset_create(DatasetCreateParams::filesystem(parent))
            .await
        {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {}
            Err(error) => return Err(error.into()),
        }
        self.client
            .dataset_set_user_properties(
                parent,
                &[(
                    property::PROPERTY_MANAGED_BY,
                    property::MANAGED_BY_VALUE.to_string(),
                )],
            )
            .await
            .map_err(Status::from)?;
        Ok(())
    }

    async fn create_blank_dataset(
        &self,
        dataset_name: &str,
        protocol: Protocol,
        capacity: u64,
        params: &HashMap<String, String>,
    ) -> Result<Dataset, Status> {
        let create = if protocol.is_block() {
            let mut create = DatasetCreateParams::zvol(dataset_name, capacity);
            let volblocksize = param(params, ids::PARAM_VOLBLOCKSIZE);
            if !volblocksize.is_empty() {
                create.volblocksize = Some(volblocksize.to_string());
            }
            create
        } else {
            DatasetCreateParams::filesystem(dataset_name)
        };
        match self.client.dataset_create(create).await {
            Ok(dataset) => Ok(dataset),
            Err(error) if error.is_conflict() => self
                .client
                .dataset_get(dataset_name)
                .await
                .map_err(Status::from)?
                .ok_or_else(|| Status::internal(format!("dataset {dataset_name} vanished mid-create"))),
            Err(error) => Err(error.into()),
        }
    }

    /// Grow the backing dataset to the declared capacity. Never shrinks.
    async fn ensure_capacity(&self, dataset: &Dataset, capacity: u64) -> Result<(), Status> {
        match dataset.kind {
            DatasetType::Volume => {
                let current = dataset.zvol_capacity().unwrap_or(0);
                if capacity > current {
                    self.client
                        .dataset_set_volsize(&dataset.name, capacity)
                        .await
                        .map_err(Status::from)?;
                }
            }
            DatasetType::Filesystem => {
                self.client
                    .dataset_set_quota(&dataset.name, capacity)
                    .await
                    .map_err(Status::from)?;
            }
        }
        Ok(())
    }

    /// Common tail of CreateVolume: enforce capacity, provision the export,
    /// persist the property bundle and build the response.
    pub(crate) async fn finish_create(
        &self,
        dataset: Dataset,
        clone: Option<CloneInfo>,
        csi_name: &str,
        protocol: Protocol,
        server: &str,
        capacity: u64,
        params: &HashMap<String, String>,
    ) -> Result<CreateVolumeResponse, Status> {
        let dataset_name = dataset.name.clone();
        let leaf = dataset_name
            .rsplit('/')
            .next()
            .unwrap_or(&dataset_name)
            .to_string();

        self.ensure_capacity(&dataset, capacity).await?;

        let mut context: HashMap<String, String> = HashMap::from([
            (ids::CONTEXT_SERVER.to_string(), server.to_string()),
            (
                ids::CONTEXT_PROTOCOL.to_string(),
                protocol.as_str().to_string(),
            ),
            (ids::CONTEXT_DATASET_NAME.to_string(), dataset_name.clone()),
            (
                ids::CONTEXT_EXPECTED_CAPACITY.to_string(),
                capacity.to_string(),
            ),
        ]);

        let mut share_path: Option<String> = None;
        let mut subsystem_nqn: Option<String> = None;
        match protocol {
            Protocol::Nfs => {
                let path = provision::ensure_nfs_share(&self.client, &dataset)
                    .await
                    .map_err(Status::from)?;
                context.insert(ids::CONTEXT_NFS_SHARE.to_string(), path.clone());
                share_path = Some(path);
            }
            Protocol::Nvmeof => {
                let nqn = match param(params, ids::PARAM_SUBSYSTEM_NQN) {
                    "" => provision::generate_nqn(&leaf),
                    provided => provided.to_string(),
                };
                let export =
                    provision::ensure_nvmeof_export(&self.client, &dataset_name, &leaf, &nqn)
                        .await
                        .map_err(Status::from)?;
                context.insert(ids::CONTEXT_NQN.to_string(), export.nqn.clone());
                context.insert(ids::CONTEXT_TRANSPORT.to_string(), export.transport);
                context.insert(ids::CONTEXT_PORT.to_string(), export.port);
                let nr_io_queues = param(params, ids::PARAM_NR_IO_QUEUES);
                if !nr_io_queues.is_empty() {
                    context.insert(ids::CONTEXT_NR_IO_QUEUES.to_string(), nr_io_queues.into());
                }
                let queue_size = param(params, ids::PARAM_QUEUE_SIZE);
                if !queue_size.is_empty() {
                    context.insert(ids::CONTEXT_QUEUE_SIZE.to_string(), queue_size.into());
                }
                subsystem_nqn = Some(export.nqn);
            }
            Protocol::Iscsi => {
                provision::ensure_iscsi_export(&self.client, &dataset_name, &leaf)
                    .await
                    .map_err(Status::from)?;
            }
        }

        if let Some(clone) = &clone {
            if clone.source_type == property::CONTENT_SOURCE_SNAPSHOT {
                context.insert(
                    ids::CONTEXT_CLONED_FROM_SNAPSHOT.to_string(),
                    ids::VALUE_TRUE.to_string(),
                );
            }
        }

        let strategy = delete_strategy_param(params)?;

        let mut properties: Vec<(&str, String)> = vec![
            (
                property::PROPERTY_MANAGED_BY,
                property::MANAGED_BY_VALUE.to_string(),
            ),
            (property::PROPERTY_CSI_VOLUME_NAME, csi_name.to_string()),
            (
                property::PROPERTY_PROTOCOL,
                protocol.as_str().to_string(),
            ),
            (property::PROPERTY_CAPACITY_BYTES, capacity.to_string()),
            (property::PROPERTY_DELETE_STRATEGY, strategy.to_string()),
        ];
        match &clone {
            Some(clone) => {
                properties.push((
                    property::PROPERTY_CONTENT_SOURCE_TYPE,
                    clone.source_type.to_string(),
                ));
                properties.push((
                    property::PROPERTY_CONTENT_SOURCE_ID,
                    clone.source_id.clone(),
                ));
                properties.push((property::PROPERTY_CLONE_MODE, clone.mode.to_string()));
                if let Some(origin) = &clone.origin_snapshot {
                    properties.push((property::PROPERTY_ORIGIN_SNAPSHOT, origin.clone()));
                }
            }
            None => properties.push((
                property::PROPERTY_CONTENT_SOURCE_TYPE,
                property::CONTENT_SOURCE_NONE.to_string(),
            )),
        }
        if let Some(path) = share_path {
            properties.push((property::PROPERTY_NFS_SHARE_PATH, path));
        }
        if let Some(nqn) = subsystem_nqn {
            properties.push((property::PROPERTY_NVME_SUBSYSTEM_NQN, nqn));
        }
        self.client
            .dataset_set_user_properties(&dataset_name, &properties)
            .await
            .map_err(Status::from)?;

        let content_source = clone.as_ref().map(|clone| VolumeContentSource {
            r#type: Some(match clone.source_type {
                property::CONTENT_SOURCE_VOLUME => volume_content_source::Type::Volume(
                    volume_content_source::VolumeSource {
                        volume_id: clone.source_id.clone(),
                    },
                ),
                _ => volume_content_source::Type::Snapshot(
                    volume_content_source::SnapshotSource {
                        snapshot_id: clone.source_id.clone(),
                    },
                ),
            }),
        });

        info!(
            "created volume {} ({}, {} bytes, protocol {})",
            csi_name, dataset_name, capacity, protocol
        );
        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: capacity as i64,
                volume_id: dataset_name,
                volume_context: context,
                content_source,
            }),
        })
    }

    async fn do_create_volume(
        &self,
        msg: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        if msg.name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }
        if msg.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }
        let params = &msg.parameters;
        let protocol = Protocol::parse(param(params, ids::PARAM_PROTOCOL)).ok_or_else(|| {
            Status::invalid_argument("the protocol parameter is required (nfs, nvmeof or iscsi)")
        })?;
        validate_capabilities(protocol, &msg.volume_capabilities)?;

        let server = param(params, ids::PARAM_SERVER);
        if server.is_empty() {
            return Err(Status::invalid_argument("the server parameter is required"));
        }
        delete_strategy_param(params)?;
        let parent = match param(params, ids::PARAM_PARENT_DATASET) {
            "" => param(params, ids::PARAM_POOL),
            parent => parent,
        };
        if parent.is_empty() {
            return Err(Status::invalid_argument(
                "either pool or parentDataset must be provided",
            ));
        }

        let name = ids::apply_name_template(&msg.name, params)
            .map_err(Status::invalid_argument)?;
        let capacity = capacity_from_range(msg.capacity_range.as_ref())?;
        let dataset_name = format!("{parent}/{name}");

        self.ensure_parent_dataset(parent).await?;

        // Idempotency probe: a dataset at the target path means an earlier
        // attempt got at least that far; reconcile and return it.
        if let Some(existing) = self
            .client
            .dataset_get(&dataset_name)
            .await
            .map_err(Status::from)?
        {
            return self
                .reconcile_existing(existing, &msg, protocol, server, capacity)
                .await;
        }

        let source = msg
            .volume_content_source
            .as_ref()
            .and_then(|source| source.r#type.as_ref());
        let (dataset, clone) = match source {
            Some(volume_content_source::Type::Snapshot(snapshot)) => {
                let (dataset, clone) = self
                    .clone_from_snapshot(&snapshot.snapshot_id, params, &name, &dataset_name)
                    .await?;
                (dataset, Some(clone))
            }
            Some(volume_content_source::Type::Volume(volume)) => {
                let (dataset, clone) = self
                    .clone_from_volume(&volume.volume_id, params, &name, &dataset_name)
                    .await?;
                (dataset, Some(clone))
            }
            None => {
                let dataset = self
                    .create_blank_dataset(&dataset_name, protocol, capacity, params)
                    .await?;
                (dataset, None)
            }
        };

        // ZFS metadata of a fresh clone needs a moment before a namespace
        // can be layered on top of it.
        if clone.is_some() && protocol == Protocol::Nvmeof {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }

        self.finish_create(dataset, clone, &msg.name, protocol, server, capacity, params)
            .await
    }

    /// Idempotent completion of a CreateVolume whose dataset already
    /// exists: verify identity, honor a larger capacity, re-run the export
    /// and property steps a failed attempt may have skipped.
    async fn reconcile_existing(
        &self,
        existing: Dataset,
        msg: &CreateVolumeRequest,
        protocol: Protocol,
        server: &str,
        capacity: u64,
    ) -> Result<CreateVolumeResponse, Status> {
        if !existing.is_managed() {
            return Err(Status::already_exists(format!(
                "dataset {} exists but is not managed by this plugin",
                existing.name
            )));
        }
        if let Some(existing_name) = existing.user_property(property::PROPERTY_CSI_VOLUME_NAME) {
            if existing_name != msg.name {
                return Err(Status::already_exists(format!(
                    "dataset {} already backs volume {existing_name}",
                    existing.name
                )));
            }
        }
        debug!(
            "volume {} already exists as {}, reconciling",
            msg.name, existing.name
        );

        let declared = existing.capacity_bytes().unwrap_or(0).max(capacity);
        let clone = clone_info_from_properties(&existing)
            .or_else(|| CloneInfo::from_request(msg));
        self.finish_create(
            existing,
            clone,
            &msg.name,
            protocol,
            server,
            declared,
            &msg.parameters,
        )
        .await
    }

    async fn do_delete_volume(&self, msg: DeleteVolumeRequest) -> Result<(), Status> {
        if msg.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        let Some(ResolvedVolume { dataset, protocol }) = self.resolve_volume(&msg.volume_id).await?
        else {
            info!("volume {} not found, delete is a no-op", msg.volume_id);
            return Ok(());
        };
        if !dataset.is_managed() {
            return Err(Status::failed_precondition(format!(
                "dataset {} is not managed by this plugin, refusing to delete",
                dataset.name
            )));
        }
        let leaf = dataset.name.rsplit('/').next().unwrap_or(&dataset.name);

        match protocol {
            Protocol::Nfs => provision::teardown_nfs_share(&self.client, &dataset.name)
                .await
                .map_err(Status::from)?,
            Protocol::Nvmeof => {
                let nqn = dataset.user_property(property::PROPERTY_NVME_SUBSYSTEM_NQN);
                provision::teardown_nvmeof_export(&self.client, &dataset.name, nqn)
                    .await
                    .map_err(Status::from)?
            }
            Protocol::Iscsi => provision::teardown_iscsi_export(&self.client, leaf)
                .await
                .map_err(Status::from)?,
        }

        let strategy = dataset
            .user_property(property::PROPERTY_DELETE_STRATEGY)
            .unwrap_or(property::DELETE_STRATEGY_DELETE);
        if strategy == property::DELETE_STRATEGY_RETAIN {
            info!(
                "delete strategy of {} is retain: clearing CSI metadata, keeping the dataset",
                dataset.name
            );
            match self
                .client
                .dataset_clear_user_properties(&dataset.name, property::VOLUME_PROPERTY_KEYS)
                .await
            {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
            return Ok(());
        }

        match self.client.dataset_delete(&dataset.name, true, true).await {
            Ok(()) => {
                info!("deleted volume dataset {}", dataset.name);
                Ok(())
            }
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn do_expand_volume(
        &self,
        msg: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status> {
        if msg.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        let capacity = capacity_from_range(msg.capacity_range.as_ref())?;
        let Some(ResolvedVolume { dataset, .. }) = self.resolve_volume(&msg.volume_id).await?
        else {
            return Err(Status::not_found(format!(
                "volume {} not found",
                msg.volume_id
            )));
        };
        if !dataset.is_managed() {
            return Err(Status::failed_precondition(format!(
                "dataset {} is not managed by this plugin",
                dataset.name
            )));
        }

        let current = dataset.capacity_bytes().unwrap_or(0);
        if capacity <= current {
            debug!(
                "volume {} already has {} bytes declared, expand to {} is a no-op",
                dataset.name, current, capacity
            );
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: current as i64,
                node_expansion_required: false,
            });
        }

        self.ensure_capacity(&dataset, capacity).await?;
        self.client
            .dataset_set_user_properties(
                &dataset.name,
                &[(property::PROPERTY_CAPACITY_BYTES, capacity.to_string())],
            )
            .await
            .map_err(Status::from)?;

        info!(
            "expanded volume {} from {} to {} bytes",
            dataset.name, current, capacity
        );
        // The node plugin has no resize path; advertising one here would
        // send the CO into NodeExpandVolume and a guaranteed failure.
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: capacity as i64,
            node_expansion_required: false,
        })
    }
}

#[tonic::async_trait]
impl controller_server::Controller for Controller {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_create_volume(msg).await.map(Response::new)
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_delete_volume(msg).await?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    /// All attach work happens at stage time on the node; the plugin
    /// advertises publish/unpublish but they are deliberate no-ops.
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        debug!(
            "ControllerPublishVolume of {} to {} is a no-op",
            msg.volume_id, msg.node_id
        );
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: HashMap::new(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        debug!(
            "ControllerUnpublishVolume of {} from {} is a no-op",
            msg.volume_id, msg.node_id
        );
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let msg = request.into_inner();
        if msg.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if msg.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }
        let Some(ResolvedVolume { protocol, .. }) = self.resolve_volume(&msg.volume_id).await?
        else {
            return Err(Status::not_found(format!(
                "volume {} not found",
                msg.volume_id
            )));
        };

        let response = match validate_capabilities(protocol, &msg.volume_capabilities) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: msg.volume_context,
                    volume_capabilities: msg.volume_capabilities,
                    parameters: msg.parameters,
                }),
                message: String::new(),
            },
            Err(status) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: status.message().to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let caps = vec![
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::CreateDeleteSnapshot,
            controller_service_capability::rpc::Type::ListSnapshots,
            controller_service_capability::rpc::Type::CloneVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
            controller_service_capability::rpc::Type::GetVolume,
            controller_service_capability::rpc::Type::GetSnapshot,
        ];
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|capability| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc {
                            r#type: capability as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_create_snapshot(msg).await.map(Response::new)
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_delete_snapshot(msg).await?;
        Ok(Response::new(DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_list_snapshots(msg).await.map(Response::new)
    }

    async fn get_snapshot(
        &self,
        request: Request<GetSnapshotRequest>,
    ) -> Result<Response<GetSnapshotResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_get_snapshot(msg).await.map(Response::new)
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("{:?}", msg);
        self.do_expand_volume(msg).await.map(Response::new)
    }

    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        let msg = request.into_inner();
        let Some(ResolvedVolume { dataset, protocol }) = self.resolve_volume(&msg.volume_id).await?
        else {
            return Err(Status::not_found(format!(
                "volume {} not found",
                msg.volume_id
            )));
        };

        let capacity = dataset.capacity_bytes().unwrap_or(0);
        let context = HashMap::from([
            (
                ids::CONTEXT_PROTOCOL.to_string(),
                protocol.as_str().to_string(),
            ),
            (ids::CONTEXT_DATASET_NAME.to_string(), dataset.name.clone()),
            (
                ids::CONTEXT_EXPECTED_CAPACITY.to_string(),
                capacity.to_string(),
            ),
        ]);
        Ok(Response::new(ControllerGetVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: capacity as i64,
                volume_id: dataset.name,
                volume_context: context,
                content_source: None,
            }),
            status: Some(controller_get_volume_response::VolumeStatus {
                published_node_ids: vec![],
                volume_condition: Some(crate::csi::VolumeCondition {
                    abnormal: false,
                    message: "volume is operational".to_string(),
                }),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(required: i64, limit: i64) -> CapacityRange {
        CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        }
    }

    #[test]
    fn capacity_defaults_to_one_gib() {
        assert_eq!(capacity_from_range(None).unwrap(), DEFAULT_CAPACITY);
        assert_eq!(
            capacity_from_range(Some(&range(0, 0))).unwrap(),
            DEFAULT_CAPACITY
        );
    }

    #[test]
    fn capacity_prefers_required_bytes() {
        assert_eq!(
            capacity_from_range(Some(&range(1073741824, 0))).unwrap(),
            1073741824
        );
        assert_eq!(
            capacity_from_range(Some(&range(0, 2147483648))).unwrap(),
            2147483648
        );
    }

    #[test]
    fn capacity_rejects_inconsistent_range() {
        assert!(capacity_from_range(Some(&range(10, 5))).is_err());
        assert!(capacity_from_range(Some(&range(-1, 0))).is_err());
    }

    fn mount_capability(mode: Mode) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(volume_capability::AccessType::Mount(
                volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    fn block_capability(mode: Mode) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(volume_capability::AccessType::Block(
                volume_capability::BlockVolume {},
            )),
            access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn delete_strategy_defaults_and_validates() {
        assert_eq!(
            delete_strategy_param(&params(&[])).unwrap(),
            property::DELETE_STRATEGY_DELETE
        );
        assert_eq!(
            delete_strategy_param(&params(&[("deleteStrategy", "retain")])).unwrap(),
            property::DELETE_STRATEGY_RETAIN
        );
        assert_eq!(
            delete_strategy_param(&params(&[("deleteStrategy", "delete")])).unwrap(),
            property::DELETE_STRATEGY_DELETE
        );
        let status = delete_strategy_param(&params(&[("deleteStrategy", "keep")])).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn nfs_supports_multi_node_mount() {
        let caps = [mount_capability(Mode::MultiNodeMultiWriter)];
        assert!(validate_capabilities(Protocol::Nfs, &caps).is_ok());
    }

    #[test]
    fn block_protocols_reject_multi_node() {
        let caps = [mount_capability(Mode::MultiNodeMultiWriter)];
        assert!(validate_capabilities(Protocol::Nvmeof, &caps).is_err());
        assert!(validate_capabilities(Protocol::Iscsi, &caps).is_err());
        let caps = [block_capability(Mode::SingleNodeWriter)];
        assert!(validate_capabilities(Protocol::Nvmeof, &caps).is_ok());
    }

    #[test]
    fn nfs_rejects_raw_block() {
        let caps = [block_capability(Mode::SingleNodeWriter)];
        assert!(validate_capabilities(Protocol::Nfs, &caps).is_err());
    }
}
