use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};
use vmt_models::{ObjectKey, TemplatePhase};

use super::{Action, ControllerContext, FINALIZER, ReconcileErr};
use crate::retry::retry_on_conflict;

/// Interval between checks while owned versions are still being removed.
const CASCADE_REQUEUE: Duration = Duration::from_secs(1);

/// Tear down a Template that has been marked for deletion.
///
/// All versions referencing the template are deleted directly through
/// storage, bypassing the deletion guard. The finalizer is only released
/// once a fresh listing comes back empty.
#[instrument(skip_all, fields(ns = %key.namespace, name = %key.name))]
pub async fn finalize(
    key: &ObjectKey,
    ctx: &ControllerContext,
) -> Result<Action, ReconcileErr> {
    mark_deleting(ctx, key).await;

    let versions = ctx.stores.versions_of(key).await?;
    if !versions.is_empty() {
        info!(remaining = versions.len(), "deleting owned versions");
        for v in &versions {
            let Ok(vkey) = v.key() else {
                continue;
            };
            match ctx.stores.versions.delete(&vkey).await {
                Ok(()) => debug!(version = %vkey, "version deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        return Ok(Action::requeue(CASCADE_REQUEUE));
    }

    let templates = &ctx.stores.templates;
    retry_on_conflict(&ctx.retry, "release-finalizer", move || async move {
        let Some(mut template) = templates.get(key).await? else {
            return Ok(());
        };
        let Some(finalizers) = template.metadata.finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER);
        if finalizers.len() != before {
            templates.replace(&template).await?;
            info!("versions gone, finalizer released");
        }
        Ok(())
    })
    .await
    .or_else(|e| if e.is_not_found() { Ok(()) } else { Err(e) })?;

    Ok(Action::await_change())
}

/// Record the `Deleting` phase. Best effort: the object may disappear or be
/// rewritten underneath us and the cascade does not depend on it.
async fn mark_deleting(ctx: &ControllerContext, key: &ObjectKey) {
    let Ok(Some(template)) = ctx.stores.templates.get(key).await else {
        return;
    };
    let mut status = template.status_or_default();
    if status.phase == Some(TemplatePhase::Deleting) {
        return;
    }
    status.phase = Some(TemplatePhase::Deleting);
    let mut updated = template;
    updated.status = Some(status);
    if let Err(e) = ctx.stores.templates.replace_status(&updated).await {
        warn!(error = %e, "could not record Deleting phase");
    }
}
