pub mod condition;
pub mod key;
pub mod template;
pub mod template_version;

pub use condition::{
    Condition, ConditionStatus, ConditionType, upsert_condition,
};
pub use key::{KeyError, ObjectKey};
pub use template::{
    TemplatePhase, VirtualMachineTemplate, VirtualMachineTemplateSpec,
    VirtualMachineTemplateStatus,
};
pub use template_version::{
    VirtualMachineTemplateVersion, VirtualMachineTemplateVersionSpec,
    VirtualMachineTemplateVersionStatus,
};

/// API group shared by both custom resources.
pub const API_GROUP: &str = "vmt.io";
pub const API_VERSION: &str = "vmt.io/v1alpha1";

/// Label carrying the owning Template name on every TemplateVersion.
pub const TEMPLATE_LABEL: &str = "vmt.io/template";
