pub mod mounts {
    /// Name prefix of user-added bind mounts that are not declared by a manifest.
    pub const EXTRA_PREFIX: &str = "extra-";
}

pub mod paths {
    pub const APPSTORE_DIR: &str = "/opt/appstore";
    pub const SDK_DIR: &str = "/opt/appstore/sdk";
    pub const PROVISION_DIR: &str = "/opt/appstore/provision";
    pub const TEMPLATES_DIR: &str = "/opt/appstore/templates";
    pub const INPUTS_FILE: &str = "/opt/appstore/inputs.json";
    pub const PERMISSIONS_FILE: &str = "/opt/appstore/permissions.json";
}

pub mod gpu {
    /// Where the host's NVIDIA libraries are mounted inside a container.
    pub const NVIDIA_LIB_DIR: &str = "/usr/lib/nvidia";
    pub const NVIDIA_LDCONF: &str = "/etc/ld.so.conf.d/nvidia.conf";
    /// Name of the bind mount carrying the NVIDIA libraries.
    pub const NVIDIA_LIBS_MOUNT: &str = "nvidia-libs";
}

pub mod actions {
    pub const INSTALL: &str = "install";
    pub const CONFIGURE: &str = "configure";
    pub const HEALTHCHECK: &str = "healthcheck";
}

pub mod provision {
    /// Prefix of structured lines written by the provisioning runner.
    pub const APPLOG_PREFIX: &str = "@@APPLOG@@";

    /// Runner exit code signalling a permission violation.
    pub const EXIT_PERMISSION_DENIED: i32 = 2;

    /// Tag added to every container created by the engine.
    pub const CONTAINER_TAG: &str = "appstore";
}

pub mod messages {
    pub const CANCELLED_BY_USER: &str = "cancelled by user";
    pub const INTERRUPTED_BY_RESTART: &str = "interrupted by service restart";
}
