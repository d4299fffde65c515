use chrono::Utc;
use tokio::time::Duration;
use tracing::{debug, info, instrument};
use vmt_models::ObjectKey;
use vmt_storage::StorageError;

use super::default_tracker::{self, DefaultDecision};
use super::status::template_status_changed;
use super::{Action, ControllerContext, FINALIZER, ReconcileErr, cascade};
use crate::retry::retry_on_conflict;

/// How long to wait before looking at a default pointer that names a version
/// which has not been sequenced yet.
const PENDING_DEFAULT_REQUEUE: Duration = Duration::from_secs(2);

#[instrument(skip_all, fields(ns = %key.namespace, name = %key.name))]
pub async fn reconcile(
    key: &ObjectKey,
    ctx: &ControllerContext,
) -> Result<Action, ReconcileErr> {
    let Some(template) = ctx.stores.templates.get(key).await? else {
        debug!("template gone");
        return Ok(Action::await_change());
    };

    if template.is_deleting() {
        return cascade::finalize(key, ctx).await;
    }

    let versions = ctx.stores.versions_of(key).await?;
    let decision = default_tracker::decide(&template, key, &versions);

    let has_finalizer = template
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == FINALIZER))
        .unwrap_or(false);
    let point_to = match &decision {
        DefaultDecision::PointSpec { version_id } => Some(version_id.as_str()),
        _ => None,
    };
    if !has_finalizer || point_to.is_some() {
        ensure_metadata(ctx, key, point_to).await?;
    }

    let stores = &ctx.stores;
    let outcome = retry_on_conflict(&ctx.retry, "template-status", move || async move {
        let Some(current) = stores.templates.get(key).await? else {
            return Ok(None);
        };
        if current.is_deleting() {
            return Ok(None);
        }
        // Listed after the template read: every allocation recorded in
        // `current` belongs to a version this list can see.
        let versions = stores.versions_of(key).await?;
        let decision = default_tracker::decide(&current, key, &versions);
        let desired =
            default_tracker::desired_status(&current, &decision, Utc::now().to_rfc3339());
        if template_status_changed(current.status.as_ref(), &desired) {
            let mut updated = current.clone();
            updated.status = Some(desired);
            stores.templates.replace_status(&updated).await?;
            if let DefaultDecision::Vacated { number } = &decision {
                info!(number, "default version gone, cleared");
            }
            debug!(?decision, "template status updated");
        }
        Ok(Some(decision))
    })
    .await?;

    match outcome {
        Some(DefaultDecision::Pending { version_id }) => {
            debug!(version = %version_id, "default version not sequenced yet");
            Ok(Action::requeue(PENDING_DEFAULT_REQUEUE))
        }
        _ => Ok(Action::await_change()),
    }
}

/// Add the cascade finalizer and, when the status already records a default
/// number, back-fill `spec.defaultVersionId` so the pointer and the number
/// describe the same version.
async fn ensure_metadata(
    ctx: &ControllerContext,
    key: &ObjectKey,
    point_to: Option<&str>,
) -> Result<(), ReconcileErr> {
    let templates = &ctx.stores.templates;
    retry_on_conflict(&ctx.retry, "template-metadata", move || async move {
        let mut template = templates
            .get(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if template.is_deleting() {
            return Ok(());
        }
        let mut changed = false;

        let finalizers = template.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
            changed = true;
        }
        if let Some(id) = point_to {
            if template.spec.default_version_id.is_none() {
                template.spec.default_version_id = Some(id.to_string());
                info!(version = id, "default version pointer initialized");
                changed = true;
            }
        }

        if changed {
            templates.replace(&template).await?;
        }
        Ok(())
    })
    .await
    .or_else(|e| if e.is_not_found() { Ok(()) } else { Err(e) })?;
    Ok(())
}
