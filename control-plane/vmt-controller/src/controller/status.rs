use vmt_models::{
    Condition, VirtualMachineTemplateStatus, VirtualMachineTemplateVersionStatus,
};

fn strip_times(conditions: Option<&Vec<Condition>>) -> Vec<Condition> {
    conditions
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|mut c| {
            c.last_transition_time = None;
            c
        })
        .collect()
}

/// Whether writing `desired` would change anything beyond timestamps.
pub fn template_status_changed(
    current: Option<&VirtualMachineTemplateStatus>,
    desired: &VirtualMachineTemplateStatus,
) -> bool {
    let Some(cur) = current else {
        return true;
    };
    cur.default_version != desired.default_version
        || cur.default_version_uid != desired.default_version_uid
        || cur.latest_version != desired.latest_version
        || cur.latest_version_id != desired.latest_version_id
        || cur.latest_version_uid != desired.latest_version_uid
        || cur.phase != desired.phase
        || strip_times(cur.conditions.as_ref()) != strip_times(desired.conditions.as_ref())
}

pub fn version_status_changed(
    current: Option<&VirtualMachineTemplateVersionStatus>,
    desired: &VirtualMachineTemplateVersionStatus,
) -> bool {
    let Some(cur) = current else {
        return true;
    };
    cur.version != desired.version
        || cur.is_default != desired.is_default
        || strip_times(cur.conditions.as_ref()) != strip_times(desired.conditions.as_ref())
}
