//! Runtime configuration assembled from the command line.

use clap::{Arg, ArgAction, ArgMatches, Command};

#[derive(Debug, Clone)]
pub struct Config {
    pub controller_socket: String,
    pub node_socket: String,
    pub node_name: String,
    pub appliance: String,
    pub api_key_file: String,
    pub accept_invalid_certs: bool,
    pub attach_permits: usize,
    pub enable_discovery: bool,
    pub verbosity: u8,
}

pub fn command() -> Command {
    Command::new("zetastor-csi")
        .about("CSI plugin provisioning volumes on ZFS network storage appliances")
        .arg(
            Arg::new("controller-socket")
                .long("controller-socket")
                .value_name("PATH")
                .default_value("/var/tmp/csi-controller.sock")
                .help("UNIX socket for controller-side CSI RPCs"),
        )
        .arg(
            Arg::new("node-socket")
                .long("node-socket")
                .value_name("PATH")
                .default_value("/var/tmp/csi-node.sock")
                .help("UNIX socket for node-side CSI RPCs"),
        )
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .value_name("NAME")
                .required(true)
                .help("Unique name of the node this instance runs on"),
        )
        .arg(
            Arg::new("appliance")
                .long("appliance")
                .value_name("HOST")
                .required(true)
                .help("Hostname or address of the storage appliance"),
        )
        .arg(
            Arg::new("api-key-file")
                .long("api-key-file")
                .value_name("PATH")
                .required(true)
                .help("File holding the appliance API key"),
        )
        .arg(
            Arg::new("insecure-tls")
                .long("insecure-tls")
                .action(ArgAction::SetTrue)
                .help("Skip TLS certificate verification (self-signed appliances)"),
        )
        .arg(
            Arg::new("nvmf-connect-permits")
                .long("nvmf-connect-permits")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .default_value("4")
                .help("Maximum concurrent NVMe-oF connect operations"),
        )
        .arg(
            Arg::new("enable-discovery")
                .long("enable-discovery")
                .action(ArgAction::SetTrue)
                .help("Run nvme discover before connecting"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Config {
        let string = |key: &str| matches.get_one::<String>(key).expect("has default").clone();
        Config {
            controller_socket: string("controller-socket"),
            node_socket: string("node-socket"),
            node_name: string("node-name"),
            appliance: string("appliance"),
            api_key_file: string("api-key-file"),
            accept_invalid_certs: matches.get_flag("insecure-tls"),
            attach_permits: *matches
                .get_one::<usize>("nvmf-connect-permits")
                .expect("has default"),
            enable_discovery: matches.get_flag("enable-discovery"),
            verbosity: matches.get_count("verbose"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_required_flags() {
        let matches = command().try_get_matches_from([
            "zetastor-csi",
            "--node-name",
            "worker-1",
            "--appliance",
            "nas.example.com",
            "--api-key-file",
            "/etc/zetastor/api-key",
        ]);
        let config = Config::from_matches(&matches.unwrap());
        assert_eq!(config.controller_socket, "/var/tmp/csi-controller.sock");
        assert_eq!(config.node_socket, "/var/tmp/csi-node.sock");
        assert_eq!(config.attach_permits, 4);
        assert!(!config.accept_invalid_certs);
        assert!(!config.enable_discovery);
    }

    #[test]
    fn missing_required_flags_fail() {
        assert!(command()
            .try_get_matches_from(["zetastor-csi", "--node-name", "worker-1"])
            .is_err());
    }
}
