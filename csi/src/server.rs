//! Zetastor CSI plugin.
//!
//! Serves the CSI Identity, Controller and Node services over two UNIX
//! domain sockets: controller-side RPCs provision datasets, shares and
//! NVMe-oF subsystems on the appliance; node-side RPCs attach, format and
//! mount the resulting volumes on this host.

#[macro_use]
extern crate tracing;

use std::{fs, io::ErrorKind, sync::Arc};

use nasapi::ApiClient;
use tokio::{net::UnixListener, sync::Semaphore};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[allow(clippy::large_enum_variant)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

mod clone;
mod config;
mod controller;
mod dev;
mod error;
mod format;
mod identity;
mod ids;
mod mount;
mod node;
mod provision;
mod retry;
mod shell;
mod snapshot;
mod snapshot_list;

use crate::{
    controller::Controller,
    csi::{
        controller_server::ControllerServer, identity_server::IdentityServer,
        node_server::NodeServer,
    },
    identity::Identity,
    node::Node,
};

/// Remove a stale socket from a previous instance, if any.
fn remove_stale_socket(path: &str) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!("removed stale CSI socket {}", path);
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(format!("error removing stale CSI socket {path}: {error}")),
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let matches = config::command().get_matches();
    let config = config::Config::from_matches(&matches);

    let level = match config.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("zetastor_csi={level},nasapi={level},jsonrpc={level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let api_key = fs::read_to_string(&config.api_key_file)
        .map_err(|error| format!("cannot read API key from {}: {error}", config.api_key_file))?
        .trim()
        .to_string();
    if api_key.is_empty() {
        return Err(format!("API key file {} is empty", config.api_key_file));
    }

    let client = ApiClient::connect(&config.appliance, &api_key, config.accept_invalid_certs)
        .await
        .map_err(|error| format!("cannot connect to appliance {}: {error}", config.appliance))?;
    info!("connected to appliance {}", config.appliance);

    remove_stale_socket(&config.controller_socket)?;
    remove_stale_socket(&config.node_socket)?;

    let controller = Controller {
        client: client.clone(),
    };
    let node = Node {
        node_name: config.node_name.clone(),
        client,
        attach_semaphore: Arc::new(Semaphore::new(config.attach_permits)),
        enable_discovery: config.enable_discovery,
    };

    let controller_listener = UnixListener::bind(&config.controller_socket)
        .map_err(|error| format!("cannot bind {}: {error}", config.controller_socket))?;
    info!("controller service bound to {}", config.controller_socket);
    let controller_server = Server::builder()
        .add_service(IdentityServer::new(Identity::default()))
        .add_service(ControllerServer::new(controller))
        .serve_with_incoming(UnixListenerStream::new(controller_listener));

    let node_listener = UnixListener::bind(&config.node_socket)
        .map_err(|error| format!("cannot bind {}: {error}", config.node_socket))?;
    info!("node service bound to {}", config.node_socket);
    let node_server = Server::builder()
        .add_service(IdentityServer::new(Identity::default()))
        .add_service(NodeServer::new(node))
        .serve_with_incoming(UnixListenerStream::new(node_listener));

    tokio::try_join!(controller_server, node_server)
        .map_err(|error| format!("CSI server failed: {error}"))?;
    Ok(())
}
