use tracing::{debug, info};
use vmt_models::{ObjectKey, TemplatePhase};
use vmt_storage::StorageError;

use super::{ControllerContext, ReconcileErr};
use crate::retry::retry_on_conflict;

/// Hand out the next version number of `template_key` to the version
/// object `version_key` with uid `version_uid`.
///
/// The template status is the allocation record: `latestVersion` is bumped
/// with a resourceVersion-conditioned write, so concurrent callers for the
/// same template never receive the same number. If the record already names
/// this exact object (by uid) as its latest allocation, that number is
/// returned again without another write; a deleted version recreated under
/// the same name gets a fresh number. The very first allocation also
/// becomes the default when no default has been chosen.
pub async fn assign_version(
    ctx: &ControllerContext,
    template_key: &ObjectKey,
    version_key: &ObjectKey,
    version_uid: &str,
) -> Result<i64, ReconcileErr> {
    let templates = &ctx.stores.templates;
    let version_id = version_key.to_string();
    let version_id = version_id.as_str();

    let number = retry_on_conflict(&ctx.retry, "assign-version", move || async move {
        let template = templates
            .get(template_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(template_key.to_string()))?;
        let mut status = template.status_or_default();

        if status.latest_version > 0
            && status.latest_version_uid.as_deref() == Some(version_uid)
        {
            debug!(template = %template_key, version = version_id, number = status.latest_version, "reusing allocation");
            return Ok(status.latest_version);
        }

        let next = status.latest_version + 1;
        status.latest_version = next;
        status.latest_version_id = Some(version_id.to_string());
        status.latest_version_uid = Some(version_uid.to_string());
        if status.default_version <= 0 && template.spec.default_version_id.is_none() {
            status.default_version = next;
            status.default_version_uid = Some(version_uid.to_string());
        }
        if !template.is_deleting() {
            status.phase = Some(TemplatePhase::Initialized);
        }

        let mut updated = template.clone();
        updated.status = Some(status);
        templates.replace_status(&updated).await?;
        info!(template = %template_key, version = version_id, number = next, "version number assigned");
        Ok(next)
    })
    .await?;

    Ok(number)
}
