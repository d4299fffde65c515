use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tracing::{debug, info, instrument, warn};
use vmt_models::{
    Condition, ConditionStatus, ConditionType, ObjectKey, TEMPLATE_LABEL,
    VirtualMachineTemplate, VirtualMachineTemplateVersionStatus, upsert_condition,
};
use vmt_storage::StorageError;

use super::default_tracker::is_default;
use super::status::version_status_changed;
use super::{Action, ControllerContext, ReconcileErr, into_internal, sequencer};
use crate::retry::retry_on_conflict;

#[instrument(skip_all, fields(ns = %key.namespace, name = %key.name))]
pub async fn reconcile(
    key: &ObjectKey,
    ctx: &ControllerContext,
) -> Result<Action, ReconcileErr> {
    let Some(version) = ctx.stores.versions.get(key).await? else {
        debug!("version gone");
        return Ok(Action::await_change());
    };
    if version.is_deleting() {
        return Ok(Action::await_change());
    }

    let template_key = match version.template_key() {
        Ok(k) => k,
        Err(e) => {
            // Admission never lets this through; nothing to reconcile.
            warn!(error = %e, "version has no usable template reference");
            return Ok(Action::await_change());
        }
    };

    let Some(template) = ctx.stores.templates.get(&template_key).await? else {
        info!(template = %template_key, "owning template gone, deleting orphan version");
        match ctx.stores.versions.delete(key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(Action::await_change());
    };
    if template.is_deleting() {
        // The template's own reconcile removes this version.
        return Ok(Action::await_change());
    }

    ensure_owner(ctx, key, &template).await?;

    let uid = version
        .metadata
        .uid
        .clone()
        .ok_or_else(|| into_internal("version has no uid"))?;
    let number = match version.version_number() {
        Some(n) => n,
        None => sequencer::assign_version(ctx, &template_key, key, &uid).await?,
    };
    let uid = uid.as_str();

    let templates = &ctx.stores.templates;
    let versions = &ctx.stores.versions;
    let template_key = &template_key;
    retry_on_conflict(&ctx.retry, "version-status", move || async move {
        let Some(current) = versions.get(key).await? else {
            return Ok(());
        };
        // A recreated namesake is a different version and gets its own number.
        if current.metadata.uid.as_deref() != Some(uid) {
            return Ok(());
        }
        let Some(template) = templates.get(template_key).await? else {
            return Ok(());
        };
        let mut status = current.status.clone().unwrap_or_default();
        // Once assigned, the number never changes.
        let assigned = *status.version.get_or_insert(number);
        let desired = VirtualMachineTemplateVersionStatus {
            version: Some(assigned),
            is_default: is_default(&template, key, Some(assigned)),
            conditions: Some(upsert_condition(
                status.conditions.as_ref(),
                Condition::new(
                    ConditionType::Sequenced,
                    ConditionStatus::True,
                    "VersionAssigned",
                    Some(format!("version {assigned} of {template_key}")),
                    Utc::now().to_rfc3339(),
                ),
            )),
        };
        if version_status_changed(current.status.as_ref(), &desired) {
            let mut updated = current.clone();
            updated.status = Some(desired);
            versions.replace_status(&updated).await?;
            debug!(number = assigned, "version status updated");
        }
        Ok(())
    })
    .await?;

    Ok(Action::await_change())
}

fn owner_reference(template: &VirtualMachineTemplate) -> Result<OwnerReference, ReconcileErr> {
    let uid = template
        .meta()
        .uid
        .clone()
        .ok_or_else(|| into_internal("template has no uid"))?;
    Ok(OwnerReference {
        api_version: VirtualMachineTemplate::api_version(&()).into_owned(),
        kind: VirtualMachineTemplate::kind(&()).into_owned(),
        name: template.metadata.name.clone().unwrap_or_default(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Point the version at its template for garbage collection and label it
/// with the template name for selection.
async fn ensure_owner(
    ctx: &ControllerContext,
    key: &ObjectKey,
    template: &VirtualMachineTemplate,
) -> Result<(), ReconcileErr> {
    let owner = owner_reference(template)?;
    let template_name = owner.name.clone();
    let versions = &ctx.stores.versions;
    let owner = &owner;
    let template_name = template_name.as_str();

    retry_on_conflict(&ctx.retry, "version-owner", move || async move {
        let Some(mut version) = versions.get(key).await? else {
            return Ok(());
        };
        let mut changed = false;

        let refs = version.metadata.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.retain(|r| r.controller != Some(true));
            refs.push(owner.clone());
            changed = true;
        }
        let labels = version.metadata.labels.get_or_insert_with(Default::default);
        if labels.get(TEMPLATE_LABEL).map(String::as_str) != Some(template_name) {
            labels.insert(TEMPLATE_LABEL.to_string(), template_name.to_string());
            changed = true;
        }

        if changed {
            versions.replace(&version).await?;
            debug!("owner reference set");
        }
        Ok::<_, StorageError>(())
    })
    .await?;
    Ok(())
}
