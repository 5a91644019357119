// Broker and peer configuration, validated once at construction.
//
// Mirrors the command-line surface of the original ivshmem-server /
// ivshmem-client tools (see `ivshmsg_server.py` / `ivshmsg_client.py`).

use std::path::{Path, PathBuf};

use crate::error::{FabricError, Result};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ivshmsg_socket";
pub const DEFAULT_MAILBOX_NAME: &str = "ivshmsg_mailbox";
pub const MAX_CLIENTS: u64 = 62;

/// Broker-side configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub mailbox_name: String,
    pub n_clients: u64,
    /// The broker does not also act as a peer. Mutually exclusive with
    /// `no_pfm`: silent mode already forgoes the broker's own peer/PFM
    /// role, so pairing it with an explicit `--no-pfm` is a conflicting,
    /// not merely redundant, pair of flags.
    pub silent: bool,
    /// Disables fabric-management ("smart") behaviors.
    pub no_pfm: bool,
    pub norecycle: bool,
    pub verbose: u8,
}

impl BrokerConfig {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        mailbox_name: impl Into<String>,
        n_clients: u64,
        silent: bool,
        no_pfm: bool,
        norecycle: bool,
        verbose: u8,
    ) -> Result<Self> {
        let socket_path = socket_path.into();
        let mailbox_name = mailbox_name.into();

        if socket_path.as_os_str().is_empty() {
            return Err(FabricError::Config("socket path must not be empty".into()));
        }
        if socket_path.exists() {
            return Err(FabricError::Config(format!(
                "socket path {} already exists",
                socket_path.display()
            )));
        }
        if mailbox_name.contains('/') {
            return Err(FabricError::Config(
                "mailbox name must not contain '/'".into(),
            ));
        }
        if n_clients < 1 || n_clients > MAX_CLIENTS {
            return Err(FabricError::Config(format!(
                "nClients must be in [1, {MAX_CLIENTS}], got {n_clients}"
            )));
        }
        if silent && no_pfm {
            return Err(FabricError::Config(
                "--silent and --no-pfm are mutually exclusive".into(),
            ));
        }

        Ok(Self {
            socket_path,
            mailbox_name,
            n_clients,
            silent,
            no_pfm,
            norecycle,
            verbose,
        })
    }

    /// Smart (fabric-management) mode is active unless explicitly disabled.
    pub fn smart(&self) -> bool {
        !self.no_pfm
    }

    pub fn n_events(&self) -> u64 {
        self.n_clients + 2
    }

    pub fn server_id(&self) -> u64 {
        self.n_clients + 1
    }

    pub fn mailbox_path(&self) -> PathBuf {
        mailbox_path(&self.mailbox_name)
    }
}

/// Peer-side configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub socket_path: PathBuf,
    pub verbose: u8,
}

impl PeerConfig {
    pub fn new(socket_path: impl Into<PathBuf>, verbose: u8) -> Result<Self> {
        let socket_path = socket_path.into();
        if !socket_path.exists() {
            return Err(FabricError::Config(format!(
                "no socket at {} (is the broker running?)",
                socket_path.display()
            )));
        }
        Ok(Self {
            socket_path,
            verbose,
        })
    }
}

pub fn mailbox_path(name: &str) -> PathBuf {
    if name.contains('/') {
        Path::new(name).to_path_buf()
    } else {
        Path::new("/dev/shm").join(name)
    }
}
