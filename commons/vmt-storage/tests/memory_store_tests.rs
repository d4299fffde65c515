use std::time::Duration;

use futures_util::StreamExt;
use vmt_models::{
    ObjectKey, VirtualMachineTemplate, VirtualMachineTemplateSpec,
    VirtualMachineTemplateVersion, VirtualMachineTemplateVersionSpec,
};
use vmt_storage::{ObjectStore, StorageError, Stores, WatchEvent, memory::MemoryStore};

fn template(ns: &str, name: &str) -> VirtualMachineTemplate {
    let mut t = VirtualMachineTemplate::new(
        name,
        VirtualMachineTemplateSpec {
            description: "testing vm template".into(),
            default_version_id: None,
        },
    );
    t.metadata.namespace = Some(ns.into());
    t
}

fn version(ns: &str, name: &str, template_id: &str) -> VirtualMachineTemplateVersion {
    let mut v = VirtualMachineTemplateVersion::new(
        name,
        VirtualMachineTemplateVersionSpec {
            template_id: template_id.into(),
            vm: serde_json::json!({"running": false}),
            ..Default::default()
        },
    );
    v.metadata.namespace = Some(ns.into());
    v
}

#[tokio::test]
async fn memory_storage_crud() {
    let store = MemoryStore::<VirtualMachineTemplate>::new();
    let created = store.create(&template("ns", "t1")).await.unwrap();
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.resource_version.is_some());

    let key = ObjectKey::new("ns", "t1");
    let fetched = store.get(&key).await.unwrap().expect("stored");
    assert_eq!(fetched.spec.description, "testing vm template");

    let dup = store.create(&template("ns", "t1")).await.unwrap_err();
    assert!(matches!(dup, StorageError::AlreadyExists(_)));

    store.create(&template("other", "t2")).await.unwrap();
    assert_eq!(store.list(Some("ns")).await.unwrap().len(), 1);
    assert_eq!(store.list(None).await.unwrap().len(), 2);

    store.delete(&key).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
    assert!(store.delete(&key).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn finalizers_hold_deletion_until_removed() {
    let store = MemoryStore::<VirtualMachineTemplate>::new();
    let mut t = template("ns", "held");
    t.metadata.finalizers = Some(vec!["vmt.io/template-versions".into()]);
    store.create(&t).await.unwrap();
    let key = ObjectKey::new("ns", "held");

    store.delete(&key).await.unwrap();
    let marked = store.get(&key).await.unwrap().expect("still present");
    assert!(marked.is_deleting());

    // A second delete is a no-op while finalizers remain.
    store.delete(&key).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_some());

    let mut release = marked.clone();
    release.metadata.finalizers = Some(vec![]);
    store.replace(&release).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn watch_reports_applied_and_deleted() {
    let store = MemoryStore::<VirtualMachineTemplate>::new();
    let mut events = store.watch();

    store.create(&template("ns", "w")).await.unwrap();
    store.delete(&ObjectKey::new("ns", "w")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, WatchEvent::Applied(_)));
    let second = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, WatchEvent::Deleted(_)));
    assert_eq!(second.object().metadata.name.as_deref(), Some("w"));
}

#[tokio::test]
async fn versions_of_filters_by_template_reference() {
    let stores = Stores::memory();
    stores
        .versions
        .create(&version("ns", "a1", "ns/a"))
        .await
        .unwrap();
    stores
        .versions
        .create(&version("ns", "a2", "ns/a"))
        .await
        .unwrap();
    stores
        .versions
        .create(&version("ns", "b1", "ns/b"))
        .await
        .unwrap();

    let owned = stores.versions_of(&ObjectKey::new("ns", "a")).await.unwrap();
    let mut names: Vec<_> = owned
        .iter()
        .filter_map(|v| v.metadata.name.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a1", "a2"]);
}
