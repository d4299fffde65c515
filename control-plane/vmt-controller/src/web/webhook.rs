use axum::{Json, extract::State};
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, Operation,
};
use tracing::{debug, error, info};
use vmt_models::{VirtualMachineTemplate, VirtualMachineTemplateVersion};

use super::WebState;
use crate::admission::AdmissionError;

fn deny<T>(req: &AdmissionRequest<T>, err: AdmissionError) -> AdmissionResponse
where
    T: kube::Resource,
{
    let mut res = AdmissionResponse::from(req).deny(err.to_string());
    res.result.code = err.status_code();
    res.result.reason = err.reason().to_string();
    res
}

pub async fn validate_template_handler(
    State(state): State<WebState>,
    Json(body): Json<AdmissionReview<VirtualMachineTemplate>>,
) -> Json<AdmissionReview<kube::core::DynamicObject>> {
    let req: AdmissionRequest<VirtualMachineTemplate> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "invalid template admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_template(&state, &req).await.into_review())
}

async fn review_template(
    state: &WebState,
    req: &AdmissionRequest<VirtualMachineTemplate>,
) -> AdmissionResponse {
    let allowed = AdmissionResponse::from(req);
    let result = match (&req.operation, req.object.as_ref()) {
        (Operation::Create, Some(obj)) | (Operation::Update, Some(obj)) => {
            state
                .validator
                .validate_template(req.old_object.as_ref(), obj)
                .await
        }
        _ => Ok(()),
    };
    match result {
        Ok(()) => allowed,
        Err(e) => {
            info!(uid = %req.uid, name = %req.name, error = %e, "template denied");
            deny(req, e)
        }
    }
}

pub async fn validate_version_handler(
    State(state): State<WebState>,
    Json(body): Json<AdmissionReview<VirtualMachineTemplateVersion>>,
) -> Json<AdmissionReview<kube::core::DynamicObject>> {
    let req: AdmissionRequest<VirtualMachineTemplateVersion> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "invalid version admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(review_version(&state, &req).await.into_review())
}

async fn review_version(
    state: &WebState,
    req: &AdmissionRequest<VirtualMachineTemplateVersion>,
) -> AdmissionResponse {
    let result = match req.operation {
        Operation::Create => match req.object.as_ref() {
            Some(obj) => {
                // The object in a create review may not carry a namespace yet.
                let mut obj = obj.clone();
                if obj.metadata.namespace.is_none() {
                    obj.metadata.namespace = req.namespace.clone();
                }
                state.validator.validate_version_create(&obj).await
            }
            None => Err(AdmissionError::validation("create request carries no object")),
        },
        Operation::Update => match (req.old_object.as_ref(), req.object.as_ref()) {
            (Some(old), Some(new)) => state.validator.validate_version_update(old, new),
            _ => Ok(()),
        },
        Operation::Delete => match req.old_object.as_ref() {
            Some(old) => state.guard.check_delete(old).await,
            None => {
                debug!(uid = %req.uid, "delete review without old object");
                Ok(())
            }
        },
        Operation::Connect => Ok(()),
    };
    match result {
        Ok(()) => AdmissionResponse::from(req),
        Err(e) => {
            info!(uid = %req.uid, name = %req.name, error = %e, "version denied");
            deny(req, e)
        }
    }
}
