use serde_json::json;
use tracing::{debug, info};
use vmt_models::{
    VirtualMachineTemplate, VirtualMachineTemplateSpec, VirtualMachineTemplateVersion,
    VirtualMachineTemplateVersionSpec,
};
use vmt_storage::StorageError;

use crate::admission::AdmissionError;
use crate::api::TemplateApi;

struct BuiltinTemplate {
    name: &'static str,
    description: &'static str,
    vm: fn() -> serde_json::Value,
}

fn disk(name: &str, bus: &str, boot_order: Option<u32>, cdrom: bool) -> serde_json::Value {
    let mut d = if cdrom {
        json!({"name": name, "cdrom": {"bus": bus}})
    } else {
        json!({"name": name, "disk": {"bus": bus}})
    };
    if let Some(order) = boot_order {
        d["bootOrder"] = json!(order);
    }
    d
}

fn base_vm(disks: Vec<serde_json::Value>, extra_devices: serde_json::Value) -> serde_json::Value {
    let mut devices = json!({
        "disks": disks,
        "interfaces": [{"name": "default", "masquerade": {}, "model": "virtio"}],
    });
    if let (Some(dst), Some(src)) = (devices.as_object_mut(), extra_devices.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    json!({
        "running": true,
        "template": {
            "spec": {
                "domain": {
                    "cpu": {"cores": 1},
                    "resources": {"limits": {"cpu": "1", "memory": "2Gi"}},
                    "devices": devices,
                },
                "networks": [{"name": "default", "pod": {}}],
            }
        }
    })
}

fn windows_iso_vm() -> serde_json::Value {
    base_vm(
        vec![
            disk("cdrom-disk", "sata", Some(1), true),
            disk("rootdisk", "virtio", Some(2), false),
            disk("virtio-container-disk", "sata", None, true),
        ],
        json!({"inputs": [{"bus": "usb", "name": "tablet", "type": "tablet"}]}),
    )
}

fn iso_vm() -> serde_json::Value {
    base_vm(
        vec![
            disk("cdrom-disk", "sata", Some(1), true),
            disk("rootdisk", "virtio", Some(2), false),
        ],
        json!({}),
    )
}

fn raw_vm() -> serde_json::Value {
    base_vm(vec![disk("rootdisk", "virtio", Some(1), false)], json!({}))
}

const BUILTIN: &[BuiltinTemplate] = &[
    BuiltinTemplate {
        name: "windows-iso-image-base-template",
        description: "Template for booting Windows from an ISO image",
        vm: windows_iso_vm,
    },
    BuiltinTemplate {
        name: "iso-image-base-template",
        description: "Template for booting a VM from an ISO image",
        vm: iso_vm,
    },
    BuiltinTemplate {
        name: "raw-image-base-template",
        description: "Template for booting a VM from a raw or qcow2 disk image",
        vm: raw_vm,
    },
];

fn ignore_exists<T>(res: Result<T, AdmissionError>) -> Result<bool, AdmissionError> {
    match res {
        Ok(_) => Ok(true),
        Err(AdmissionError::Storage(StorageError::AlreadyExists(_))) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Make sure every built-in template and its first version exist in
/// `namespace`. Existing objects are left untouched.
pub async fn seed_default_templates(api: &TemplateApi, namespace: &str) -> Result<(), AdmissionError> {
    for builtin in BUILTIN {
        let mut template = VirtualMachineTemplate::new(
            builtin.name,
            VirtualMachineTemplateSpec {
                description: builtin.description.to_string(),
                default_version_id: None,
            },
        );
        template.metadata.namespace = Some(namespace.to_string());
        if ignore_exists(api.create_template(&template).await)? {
            info!(template = builtin.name, "seeded built-in template");
        } else {
            debug!(template = builtin.name, "built-in template already present");
        }

        let mut version = VirtualMachineTemplateVersion::new(
            &format!("{}-v1", builtin.name),
            VirtualMachineTemplateVersionSpec {
                template_id: format!("{namespace}/{}", builtin.name),
                description: Some(builtin.description.to_string()),
                key_pair_ids: Vec::new(),
                vm: (builtin.vm)(),
            },
        );
        version.metadata.namespace = Some(namespace.to_string());
        ignore_exists(api.create_version(&version).await)?;
    }
    Ok(())
}

pub fn builtin_template_names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|b| b.name)
}
