//! Deployment state store tests

use chrono::{TimeZone, Utc};
use tokio_test::assert_ok;

use provisioner::errors::ProvisionError;
use provisioner::filesys::dir::Dir;
use provisioner::models::deployment::{Deployment, DeploymentStatus, EscalationRecord};
use provisioner::storage::state::DeploymentStore;

use crate::support::descriptor;

fn store(dir: &tempfile::TempDir) -> DeploymentStore {
    DeploymentStore::new(Dir::new(dir.path().join("deployments")))
}

#[tokio::test]
async fn test_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
    let mut deployment = Deployment::new(&descriptor(), 9, created);
    deployment.transition(DeploymentStatus::Running).unwrap();
    deployment.set_current_step(4, Some("configure_backend")).unwrap();
    deployment.record_error("configure_backend: `npm ci` exited 1");
    deployment.add_warning("configure_backend: recovered with reinstall_dependencies");
    deployment.verification.record(true, false, true);
    deployment.escalation = Some(EscalationRecord {
        issue_id: Some("ISSUE-7".to_string()),
        pr_id: None,
    });

    assert_ok!(store.save(&deployment).await);
    let loaded = store.load(&deployment.id).await.unwrap();

    assert_eq!(loaded, deployment);
    assert_eq!(loaded.id, "203-0-113-10-20240301123005");
    assert_eq!(
        (loaded.status, loaded.current_step, loaded.total_steps, &loaded.server),
        (DeploymentStatus::Running, 4, 9, &deployment.server)
    );
    assert!(!loaded.verification.critical_checks_passed);
}

#[tokio::test]
async fn test_save_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let mut deployment = Deployment::new(&descriptor(), 3, Utc::now());
    store.save(&deployment).await.unwrap();
    deployment.transition(DeploymentStatus::Running).unwrap();
    deployment.set_current_step(1, Some("step2")).unwrap();
    store.save(&deployment).await.unwrap();

    let loaded = store.load(&deployment.id).await.unwrap();
    assert_eq!(loaded.current_step, 1);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_orders_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    assert!(store.list().await.unwrap().is_empty());

    for hour in [14, 9, 11] {
        let created = Utc.with_ymd_and_hms(2024, 5, 2, hour, 0, 0).unwrap();
        store.save(&Deployment::new(&descriptor(), 3, created)).await.unwrap();
    }

    let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(
        ids,
        vec![
            "203-0-113-10-20240502090000",
            "203-0-113-10-20240502110000",
            "203-0-113-10-20240502140000"
        ]
    );
}

#[tokio::test]
async fn test_missing_and_invalid_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    assert!(matches!(store.load("nope").await, Err(ProvisionError::NotFound(_))));
    assert!(matches!(
        store.load("../etc/passwd").await,
        Err(ProvisionError::ValidationError(_))
    ));
    assert!(matches!(store.load(".hidden").await, Err(ProvisionError::ValidationError(_))));
}

#[tokio::test]
async fn test_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    let deployment = Deployment::new(&descriptor(), 3, Utc::now());
    store.save(&deployment).await.unwrap();
    store.remove(&deployment.id).await.unwrap();
    assert!(matches!(store.load(&deployment.id).await, Err(ProvisionError::NotFound(_))));
}

#[tokio::test]
async fn test_create_claims_a_free_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let created = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();

    let mut first = Deployment::new(&descriptor(), 3, created);
    let mut second = Deployment::new(&descriptor(), 3, created);
    assert_ok!(store.create(&mut first).await);
    assert_ok!(store.create(&mut second).await);

    assert_eq!(first.id, "203-0-113-10-20240601080000");
    assert_eq!(second.id, "203-0-113-10-20240601080000-2");
    assert_eq!(store.load(&second.id).await.unwrap(), second);
    assert_eq!(store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_creates_never_share_an_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let created = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();

    let mut a = Deployment::new(&descriptor(), 3, created);
    let mut b = Deployment::new(&descriptor(), 3, created);
    let mut c = Deployment::new(&descriptor(), 3, created);
    let (ra, rb, rc) = tokio::join!(store.create(&mut a), store.create(&mut b), store.create(&mut c));
    assert_ok!(ra);
    assert_ok!(rb);
    assert_ok!(rc);

    let mut ids = vec![a.id, b.id, c.id];
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(store.list().await.unwrap().len(), 3);
}
