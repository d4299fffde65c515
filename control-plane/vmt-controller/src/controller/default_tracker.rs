use vmt_models::{
    Condition, ConditionStatus, ConditionType, ObjectKey, VirtualMachineTemplate,
    VirtualMachineTemplateStatus, VirtualMachineTemplateVersion, upsert_condition,
};

/// What the template reconciler should do about the default pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultDecision {
    /// No version has been sequenced yet and nobody picked a default.
    Unset,
    /// Status already names a default number but the spec pointer is empty;
    /// fill the pointer in with this version id.
    PointSpec { version_id: String },
    /// The spec pointer names a sequenced version whose number differs from
    /// `status.defaultVersion`.
    Adopt { number: i64, uid: Option<String> },
    /// Spec and status agree.
    Keep,
    /// The named version exists but has no number yet.
    Pending { version_id: String },
    /// The spec pointer cannot be resolved to a live version of this template.
    Invalid { message: String },
    /// Status names a default number that no live version holds any more;
    /// clear it so the next sequenced version becomes the default.
    Vacated { number: i64 },
}

/// Resolve the template's default pointer against its live versions.
///
/// `versions` may contain versions of other templates or ones being
/// deleted; both are ignored.
pub fn decide(
    template: &VirtualMachineTemplate,
    template_key: &ObjectKey,
    versions: &[VirtualMachineTemplateVersion],
) -> DefaultDecision {
    let status = template.status_or_default();
    let mut live = versions
        .iter()
        .filter(|v| v.belongs_to(template_key) && !v.is_deleting());

    let Some(requested) = template.spec.default_version_id.as_deref() else {
        if status.default_version <= 0 {
            return DefaultDecision::Unset;
        }
        let holder = live
            .filter(|v| holds_status_default(&status, v))
            .find_map(|v| v.key().ok());
        return match holder {
            Some(k) => DefaultDecision::PointSpec {
                version_id: k.to_string(),
            },
            None => DefaultDecision::Vacated {
                number: status.default_version,
            },
        };
    };

    let wanted: ObjectKey = match requested.parse() {
        Ok(k) => k,
        Err(e) => {
            return DefaultDecision::Invalid {
                message: format!("defaultVersionId {requested:?}: {e}"),
            };
        }
    };

    let found = live.find(|v| v.key().map(|k| k == wanted).unwrap_or(false));
    match found.and_then(|v| v.version_number().map(|n| (v, n))) {
        Some((_, n)) if n == status.default_version => DefaultDecision::Keep,
        Some((v, n)) => DefaultDecision::Adopt {
            number: n,
            uid: v.metadata.uid.clone(),
        },
        None if found.is_some() => DefaultDecision::Pending {
            version_id: wanted.to_string(),
        },
        None => DefaultDecision::Invalid {
            message: format!("version {wanted} is not a live version of {template_key}"),
        },
    }
}

/// Status the template should carry given `decision`. Sequencing fields are
/// copied through untouched; only the sequencer moves them.
pub fn desired_status(
    template: &VirtualMachineTemplate,
    decision: &DefaultDecision,
    now: String,
) -> VirtualMachineTemplateStatus {
    let mut status = template.status_or_default();
    let condition = match decision {
        DefaultDecision::Unset => Condition::new(
            ConditionType::DefaultVersionValid,
            ConditionStatus::Unknown,
            "NoDefaultVersion",
            Some("no version has been sequenced yet".into()),
            now,
        ),
        DefaultDecision::PointSpec { .. } | DefaultDecision::Keep => Condition::new(
            ConditionType::DefaultVersionValid,
            ConditionStatus::True,
            "DefaultVersionResolved",
            None,
            now,
        ),
        DefaultDecision::Adopt { number, uid } => {
            status.default_version = *number;
            status.default_version_uid = uid.clone();
            Condition::new(
                ConditionType::DefaultVersionValid,
                ConditionStatus::True,
                "DefaultVersionResolved",
                None,
                now,
            )
        }
        DefaultDecision::Pending { version_id } => Condition::new(
            ConditionType::DefaultVersionValid,
            ConditionStatus::Unknown,
            "VersionNotSequenced",
            Some(format!("waiting for {version_id} to be sequenced")),
            now,
        ),
        DefaultDecision::Invalid { message } => Condition::new(
            ConditionType::DefaultVersionValid,
            ConditionStatus::False,
            "DefaultVersionNotFound",
            Some(message.clone()),
            now,
        ),
        DefaultDecision::Vacated { number } => {
            status.default_version = 0;
            status.default_version_uid = None;
            Condition::new(
                ConditionType::DefaultVersionValid,
                ConditionStatus::Unknown,
                "DefaultVersionDeleted",
                Some(format!("version {number} is gone; next version becomes default")),
                now,
            )
        }
    };
    status.conditions = Some(upsert_condition(status.conditions.as_ref(), condition));
    status.phase = Some(template.observed_phase());
    status
}

/// Whether `version` holds the number recorded in `status.defaultVersion`.
///
/// The sequencer writes the template record before the version's own
/// status, so a version that is not numbered yet is matched by uid.
fn holds_status_default(
    status: &VirtualMachineTemplateStatus,
    version: &VirtualMachineTemplateVersion,
) -> bool {
    let default = status.default_version;
    if default <= 0 {
        return false;
    }
    match version.version_number() {
        Some(n) => n == default,
        None => {
            version.metadata.uid.is_some() && status.default_version_uid == version.metadata.uid
        }
    }
}

/// Whether deleting `version` would remove the template's default, either
/// the one named by `spec.defaultVersionId` or, while that pointer is still
/// empty, the one recorded in `status.defaultVersion`.
pub fn holds_default(
    template: &VirtualMachineTemplate,
    version: &VirtualMachineTemplateVersion,
) -> bool {
    let Ok(key) = version.key() else {
        return false;
    };
    match template.spec.default_version_id.as_deref() {
        Some(id) => id == key.to_string(),
        None => holds_status_default(&template.status_or_default(), version),
    }
}

/// Whether `version_key` is the template's current default.
pub fn is_default(
    template: &VirtualMachineTemplate,
    version_key: &ObjectKey,
    number: Option<i64>,
) -> bool {
    match template.spec.default_version_id.as_deref() {
        Some(id) => id == version_key.to_string(),
        None => {
            let default = template.status_or_default().default_version;
            default > 0 && number == Some(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmt_models::{
        VirtualMachineTemplateSpec, VirtualMachineTemplateVersionSpec,
        VirtualMachineTemplateVersionStatus,
    };

    fn key() -> ObjectKey {
        ObjectKey::new("ns", "t")
    }

    fn template(default_id: Option<&str>, default_version: i64) -> VirtualMachineTemplate {
        let mut t = VirtualMachineTemplate::new(
            "t",
            VirtualMachineTemplateSpec {
                description: String::new(),
                default_version_id: default_id.map(String::from),
            },
        );
        t.metadata.namespace = Some("ns".into());
        t.status = Some(VirtualMachineTemplateStatus {
            default_version,
            latest_version: 3,
            ..Default::default()
        });
        t
    }

    fn version(name: &str, template_id: &str, number: Option<i64>) -> VirtualMachineTemplateVersion {
        let mut v = VirtualMachineTemplateVersion::new(
            name,
            VirtualMachineTemplateVersionSpec {
                template_id: template_id.into(),
                ..Default::default()
            },
        );
        v.metadata.namespace = Some("ns".into());
        v.status = number.map(|n| VirtualMachineTemplateVersionStatus {
            version: Some(n),
            ..Default::default()
        });
        v
    }

    fn versions() -> Vec<VirtualMachineTemplateVersion> {
        vec![
            version("v1", "ns/t", Some(1)),
            version("v2", "ns/t", Some(2)),
            version("v3", "ns/t", None),
            version("x1", "ns/other", Some(1)),
        ]
    }

    #[test]
    fn empty_pointer_is_filled_from_status_number() {
        let d = decide(&template(None, 2), &key(), &versions());
        assert_eq!(
            d,
            DefaultDecision::PointSpec {
                version_id: "ns/v2".into()
            }
        );
        assert_eq!(decide(&template(None, 0), &key(), &versions()), DefaultDecision::Unset);
    }

    #[test]
    fn explicit_pointer_is_adopted() {
        assert_eq!(
            decide(&template(Some("ns/v2"), 1), &key(), &versions()),
            DefaultDecision::Adopt { number: 2, uid: None }
        );
        assert_eq!(
            decide(&template(Some("ns/v1"), 1), &key(), &versions()),
            DefaultDecision::Keep
        );
        assert!(matches!(
            decide(&template(Some("ns/v3"), 1), &key(), &versions()),
            DefaultDecision::Pending { .. }
        ));
    }

    #[test]
    fn foreign_or_missing_pointer_is_invalid_and_leaves_numbers() {
        for bad in ["ns/x1", "ns/missing", "garbage"] {
            let tpl = template(Some(bad), 1);
            let d = decide(&tpl, &key(), &versions());
            assert!(matches!(d, DefaultDecision::Invalid { .. }), "{bad}: {d:?}");

            let status = desired_status(&tpl, &d, "now".into());
            assert_eq!(status.default_version, 1);
            assert_eq!(status.latest_version, 3);
            let cond = &status.conditions.unwrap()[0];
            assert_eq!(cond.type_, ConditionType::DefaultVersionValid);
            assert_eq!(cond.status, ConditionStatus::False);
        }
    }

    #[test]
    fn deleting_versions_are_not_candidates() {
        let mut vs = versions();
        vs[1].metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(matches!(
            decide(&template(Some("ns/v2"), 1), &key(), &vs),
            DefaultDecision::Invalid { .. }
        ));
    }

    #[test]
    fn is_default_prefers_spec_pointer() {
        let v2 = ObjectKey::new("ns", "v2");
        assert!(is_default(&template(Some("ns/v2"), 1), &v2, Some(2)));
        assert!(!is_default(&template(Some("ns/v1"), 2), &v2, Some(2)));
        assert!(is_default(&template(None, 2), &v2, Some(2)));
        assert!(!is_default(&template(None, 0), &v2, None));
    }
    #[test]
    fn default_number_without_live_holder_is_vacated() {
        // v1 carried default 1 and is gone; v2 is still around.
        let vs = vec![version("v2", "ns/t", Some(2))];
        let tpl = template(None, 1);
        let d = decide(&tpl, &key(), &vs);
        assert_eq!(d, DefaultDecision::Vacated { number: 1 });

        let status = desired_status(&tpl, &d, "now".into());
        assert_eq!(status.default_version, 0);
        assert_eq!(status.latest_version, 3);
        let cond = &status.conditions.unwrap()[0];
        assert_eq!(cond.status, ConditionStatus::Unknown);
        assert_eq!(cond.reason.as_deref(), Some("DefaultVersionDeleted"));
    }

    #[test]
    fn unnumbered_version_holds_the_default_by_uid() {
        let mut tpl = template(None, 3);
        tpl.status.as_mut().unwrap().default_version_uid = Some("uid-v3".into());
        let mut vs = versions();
        vs[2].metadata.uid = Some("uid-v3".into());

        assert_eq!(
            decide(&tpl, &key(), &vs),
            DefaultDecision::PointSpec {
                version_id: "ns/v3".into()
            }
        );
        assert!(holds_default(&tpl, &vs[2]));
        assert!(!holds_default(&tpl, &vs[1]));

        // Same name, different object: not the holder.
        let mut namesake = vs[2].clone();
        namesake.metadata.uid = Some("uid-other".into());
        assert!(!holds_default(&tpl, &namesake));
    }

    #[test]
    fn holds_default_follows_spec_pointer_first() {
        let vs = versions();
        assert!(holds_default(&template(Some("ns/v2"), 1), &vs[1]));
        assert!(!holds_default(&template(Some("ns/v2"), 1), &vs[0]));
        assert!(holds_default(&template(None, 1), &vs[0]));
        assert!(!holds_default(&template(None, 0), &vs[0]));
    }
}
