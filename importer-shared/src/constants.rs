//! Constants shared by the importer library and its binary.
//!
//! These must stay in step with what the controller mounts into the
//! importer pod and reads back from it.

/// Environment variables read by the importer
pub mod envs {
    pub const SOURCE: &str = "IMPORTER_SOURCE";
    pub const ENDPOINT: &str = "IMPORTER_ENDPOINT";
    pub const CONTENT_TYPE: &str = "IMPORTER_CONTENTTYPE";
    pub const IMAGE_SIZE: &str = "IMPORTER_IMAGE_SIZE";
    pub const ACCESS_KEY_ID: &str = "IMPORTER_ACCESS_KEY_ID";
    pub const SECRET_KEY: &str = "IMPORTER_SECRET_KEY";
    pub const CERT_DIR: &str = "IMPORTER_CERT_DIR";
    pub const PROXY_CERT_DIR: &str = "IMPORTER_PROXY_CERT_DIR";
    pub const INSECURE_TLS: &str = "INSECURE_TLS";
    pub const DISK_ID: &str = "IMPORTER_DISK_ID";
    pub const UUID: &str = "IMPORTER_UUID";
    pub const BACKING_FILE: &str = "IMPORTER_BACKING_FILE";
    pub const THUMBPRINT: &str = "IMPORTER_THUMBPRINT";
    pub const CURRENT_CHECKPOINT: &str = "IMPORTER_CURRENT_CHECKPOINT";
    pub const PREVIOUS_CHECKPOINT: &str = "IMPORTER_PREVIOUS_CHECKPOINT";
    pub const FINAL_CHECKPOINT: &str = "IMPORTER_FINAL_CHECKPOINT";
    pub const VDDK_CONFIG: &str = "IMPORTER_VDDK_CONFIG";
    pub const CHECKSUM: &str = "IMPORTER_CHECKSUM";
    pub const REGISTRY_IMAGE_ARCHITECTURE: &str = "IMPORTER_REGISTRY_IMAGE_ARCHITECTURE";
    pub const PULL_METHOD: &str = "IMPORTER_PULL_METHOD";
    pub const GOOGLE_CREDENTIALS: &str = "IMPORTER_GOOGLE_CREDENTIALS";
    pub const DATA_DIR: &str = "IMPORTER_DATA_DIR";
    pub const WRITE_PATH: &str = "IMPORTER_WRITE_PATH";
    pub const SCRATCH_DIR: &str = "IMPORTER_SCRATCH_DIR";
    pub const VOLUME_MODE: &str = "VOLUME_MODE";
    pub const FILESYSTEM_OVERHEAD: &str = "FILESYSTEM_OVERHEAD";
    pub const PREALLOCATION: &str = "PREALLOCATION";
    pub const OWNER_UID: &str = "OWNER_UID";
    pub const TERMINATION_MESSAGE_PATH: &str = "IMPORTER_TERMINATION_MESSAGE_PATH";
    pub const SECRET_EXTRA_HEADERS_DIR: &str = "IMPORTER_SECRET_EXTRA_HEADERS_DIR";
    pub const LOG_DIR: &str = "IMPORTER_LOG_DIR";

    /// Prefix of variables that each carry one extra HTTP header.
    pub const EXTRA_HEADER_PREFIX: &str = "IMPORTER_EXTRA_HEADER";
}

/// Fixed filesystem locations inside the importer pod
pub mod paths {
    /// Filesystem-mode destination directory
    pub const DATA_DIR: &str = "/data";

    /// Filesystem-mode destination image
    pub const DATA_FILE: &str = "/data/disk.img";

    /// Block-mode destination device
    pub const BLOCK_DEVICE: &str = "/dev/cdi-block-volume";

    /// Scratch space mount
    pub const SCRATCH_DIR: &str = "/scratch";

    /// Mounted secret holding extra HTTP headers, one per file
    pub const EXTRA_HEADERS_DIR: &str = "/extraheaders";

    /// Proxy CA bundle mount
    pub const PROXY_CERT_DIR: &str = "/proxycerts";

    /// Where the kubelet reads the termination message from
    pub const TERMINATION_LOG: &str = "/dev/termination-log";

    /// Name of the temporary image written to scratch space
    pub const SCRATCH_IMAGE_NAME: &str = "tmpimage";

    /// Directory inside a container image that holds the disk
    pub const CONTAINER_DISK_DIR: &str = "disk";
}

/// nbdkit and VDDK locations
pub mod nbdkit {
    /// Unix socket nbdkit listens on
    pub const SOCKET: &str = "/tmp/nbd.sock";

    /// PID file nbdkit writes once it is serving
    pub const PID_FILE: &str = "/tmp/nbd.pid";

    /// VDDK distribution root
    pub const VDDK_LIB_DIR: &str = "/opt/vmware-vix-disklib-distrib";

    /// VDDK shared libraries, prepended to LD_LIBRARY_PATH
    pub const VDDK_LIB64_DIR: &str = "/opt/vmware-vix-disklib-distrib/lib64";

    /// Test plugin used instead of the real VDDK plugin when present
    pub const MOCK_PLUGIN: &str = "/opt/testing/libvddk-test-plugin.so";

    /// Real plugin name
    pub const VDDK_PLUGIN: &str = "vddk";

    /// Lines of nbdkit output kept for the post-mortem dump
    pub const MAX_LOG_LINES: usize = 1000;

    /// Poll interval while waiting for the PID file (milliseconds)
    pub const PID_POLL_INTERVAL_MS: u64 = 500;

    /// Give up waiting for the PID file after this long (seconds)
    pub const PID_WAIT_TIMEOUT_SECS: u64 = 15;
}

/// Transfer sizing
pub mod transfer {
    /// Largest header any detector needs
    pub const MAX_EXPECTED_HDR_SIZE: usize = 1024;

    /// Granularity of hole detection when streaming to a sparse file
    pub const SPARSE_BOUNDARY: usize = 32 * 1024;

    /// Chunk size when zero-filling without hole punching
    pub const ZERO_FILL_CHUNK: usize = 16 << 20;

    /// Largest NBD block-status request
    pub const MAX_BLOCK_STATUS_LENGTH: u64 = 2 << 30;

    /// Largest NBD read against an ESXi host
    pub const MAX_PREAD_LENGTH_ESX: usize = 23 << 20;

    /// Largest NBD read through vCenter
    pub const MAX_PREAD_LENGTH_VC: usize = 2 << 20;

    /// Extents shorter than this are copied without a block-status query
    pub const MIN_BLOCK_STATUS_EXTENT: u64 = 1024 * 1024;

    /// HTTP transfers are cancelled after this long without a byte (seconds)
    pub const IDLE_TIMEOUT_SECS: u64 = 10 * 60;

    /// How often the idle watchdog and progress ticker wake up (milliseconds)
    pub const POLL_INTERVAL_MS: u64 = 1000;
}

/// Resource limits for short-lived qemu-img invocations
pub mod qemu {
    /// Address space limit (bytes)
    pub const MAX_MEMORY: u64 = 1 << 30;

    /// CPU time limit (seconds)
    pub const MAX_CPU_SECS: u64 = 30;

    /// Read timeout handed to qemu's curl driver (seconds)
    pub const HTTP_READ_TIMEOUT_SECS: u64 = 3600;
}

/// Termination messages written on exit
pub mod messages {
    pub const IMPORT_COMPLETE: &str = "Import Complete";
    pub const IMPORT_PAUSED: &str = "Import Paused";
    pub const UPLOAD_COMPLETE: &str = "Upload Complete";
    pub const CLONE_COMPLETE: &str = "Clone Complete";
}

/// HTTP protocol details
pub mod http {
    pub const USER_AGENT: &str = "cdi-importer";

    /// Header naming the payload of a push upload
    pub const CONTENT_TYPE_HEADER: &str = "x-cdi-content-type";
    pub const FILESYSTEM_CLONE: &str = "filesystem-clone";
    pub const BLOCKDEVICE_CLONE: &str = "blockdevice-clone";

    /// Pull method under which the HTTP origin is a node-local image server
    pub const PULL_METHOD_NODE: &str = "node";
}

/// Progress metric naming
pub mod metrics {
    pub const PROGRESS_NAME: &str = "kubevirt_cdi_import_progress_total";
    pub const OWNER_UID_LABEL: &str = "ownerUID";
}
