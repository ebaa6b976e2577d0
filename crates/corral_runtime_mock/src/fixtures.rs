//! Ready-made manifests for demos and tests.

use corral_core::prelude::*;

fn base(id: &str, name: &str, version: &str) -> AppManifest {
    AppManifest {
        id: id.into(),
        name: name.into(),
        description: format!("{name} packaged for corral"),
        version: version.into(),
        categories: vec!["demo".into()],
        lxc: LxcConfig {
            ostemplate: "debian-12".into(),
            defaults: LxcDefaults {
                unprivileged: true,
                cores: 1,
                memory_mb: 512,
                disk_gb: 4,
                features: vec!["nesting=1".into()],
                onboot: true,
            },
            extra_config: Vec::new(),
        },
        provisioning: ProvisioningSpec {
            script: "provision/install.py".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Web server with one managed volume and one optional media bind.
pub fn nginx() -> AppManifest {
    AppManifest {
        inputs: vec![
            InputSpec {
                key: "http_port".into(),
                label: "HTTP port".into(),
                kind: InputType::Number,
                default: Some(serde_json::json!(80)),
                validation: Some(InputValidation {
                    min: Some(1.0),
                    max: Some(65535.0),
                    ..Default::default()
                }),
                ..Default::default()
            },
            InputSpec {
                key: "server_name".into(),
                label: "Server name".into(),
                default: Some(serde_json::json!("localhost")),
                reconfigurable: true,
                ..Default::default()
            },
        ],
        outputs: vec![OutputSpec {
            key: "url".into(),
            label: "URL".into(),
            value: "http://{{ip}}:{{http_port}}".into(),
        }],
        volumes: vec![
            VolumeSpec {
                name: "data".into(),
                kind: MountKind::Volume,
                mount_path: "/var/www".into(),
                size_gb: 2,
                label: "Web root".into(),
                required: true,
                ..Default::default()
            },
            VolumeSpec {
                name: "media".into(),
                kind: MountKind::Bind,
                mount_path: "/media".into(),
                label: "Media library".into(),
                read_only: true,
                ..Default::default()
            },
        ],
        permissions: PermissionsSpec {
            packages: vec!["nginx".into()],
            services: vec!["nginx".into()],
            ..Default::default()
        },
        ..base("nginx", "Nginx", "1.2.0")
    }
}

/// Key-value store listening on a high port.
pub fn redis() -> AppManifest {
    let mut manifest = AppManifest {
        inputs: vec![InputSpec {
            key: "port".into(),
            label: "Port".into(),
            kind: InputType::Number,
            default: Some(serde_json::json!(6379)),
            validation: Some(InputValidation {
                min: Some(1024.0),
                max: Some(65535.0),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volumes: vec![VolumeSpec {
            name: "data".into(),
            kind: MountKind::Volume,
            mount_path: "/var/lib/redis".into(),
            size_gb: 1,
            label: "Data".into(),
            required: true,
            ..Default::default()
        }],
        permissions: PermissionsSpec {
            packages: vec!["redis-server".into()],
            services: vec!["redis-server".into()],
            ..Default::default()
        },
        ..base("redis", "Redis", "7.2.4")
    };
    manifest.lxc.defaults.cores = 2;
    manifest.lxc.defaults.memory_mb = 1024;
    manifest
}

/// Media server that prefers a render node.
pub fn jellyfin() -> AppManifest {
    let mut manifest = AppManifest {
        gpu: GpuSpec {
            required: false,
            profiles: vec!["dri-render".into()],
        },
        volumes: vec![VolumeSpec {
            name: "config".into(),
            kind: MountKind::Volume,
            mount_path: "/var/lib/jellyfin".into(),
            size_gb: 4,
            label: "Config".into(),
            required: true,
            ..Default::default()
        }],
        ..base("jellyfin", "Jellyfin", "10.9.0")
    };
    manifest.lxc.defaults.memory_mb = 2048;
    manifest.lxc.defaults.disk_gb = 8;
    manifest
}
