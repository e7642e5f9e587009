mod common;

use std::sync::Arc;

use common::*;
use remediation_core::config::CorrectionConfig;
use remediation_core::constants::{CveHostStatus, RepoStatus, ScanStatus};
use remediation_core::{CorrectionSweeper, ProgressStore, RemediationError};

fn sweeper(harness: &Harness, threshold_min: u64) -> CorrectionSweeper {
    CorrectionSweeper::new(
        harness.store.clone(),
        CorrectionConfig {
            enabled: true,
            interval_seconds: 1,
            service_timeout_threshold_min: threshold_min,
        },
    )
}

#[tokio::test]
async fn only_tasks_past_the_threshold_are_corrected() {
    let harness = Harness::new(Vec::new());
    let task = harness
        .service
        .generate_cve_task(USER, CveFixRequestBuilder::new().with_cve("CVE-1", &[1, 2]).build())
        .await
        .unwrap();
    harness.store.init_cve_task(&task.task_id, &[]).await.unwrap();
    let sweeper = sweeper(&harness, 15);

    let early = sweeper.sweep_once(task.create_time + 15 * 60 - 1).await.unwrap();
    assert!(early.is_empty());
    let units = harness.store.get_cve_units(&task.task_id).await.unwrap();
    assert!(units.iter().all(|u| u.status == CveHostStatus::Running));

    let corrections = sweeper.sweep_once(task.create_time + 15 * 60).await.unwrap();
    assert_eq!(corrections.len(), 1);
    assert_eq!(corrections[0].task_id, task.task_id);
    assert_eq!(corrections[0].age_seconds, 15 * 60);
    assert_eq!(corrections[0].corrected_units, 2);

    let units = harness.store.get_cve_units(&task.task_id).await.unwrap();
    assert!(units.iter().all(|u| u.status == CveHostStatus::Unknown));
    let cves = harness.store.get_task_cves(&task.task_id).await.unwrap();
    assert_eq!(cves[0].progress, 2);

    // nothing left to correct
    let again = sweeper.sweep_once(task.create_time + 16 * 60).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn repo_and_scan_tasks_are_corrected_by_kind() {
    let harness = Harness::new(Vec::new());
    register_hosts(&harness.store, USER, &[1, 2]).await;
    let repo = harness
        .service
        .generate_repo_task(USER, repo_request("update", &[1]))
        .await
        .unwrap();
    harness
        .store
        .set_repo_status(&repo.task_id, &[], RepoStatus::Running)
        .await
        .unwrap();
    let scan = harness
        .service
        .generate_scan_task(USER, scan_request(&[2]))
        .await
        .unwrap()
        .result;
    harness.store.init_host_scan(&[2], scan.create_time).await.unwrap();

    let now = repo.create_time.max(scan.create_time) + 3600;
    let corrections = sweeper(&harness, 15).sweep_once(now).await.unwrap();
    assert_eq!(corrections.len(), 2);

    let units = harness.store.get_repo_units(&repo.task_id).await.unwrap();
    assert_eq!(units[0].status, RepoStatus::Unknown);
    let hosts = harness.store.get_hosts(USER, &[2]).await.unwrap();
    assert_eq!(hosts[0].scan_status, Some(ScanStatus::Done));
}

#[tokio::test]
async fn store_failure_fails_the_sweep() {
    let harness = Harness::new(Vec::new());
    harness.store.fail_operation("running_tasks");

    let err = sweeper(&harness, 15).sweep_once(0).await.unwrap_err();
    assert!(matches!(err, RemediationError::Persistence(_)));
}

#[tokio::test]
async fn one_failed_correction_does_not_stop_the_sweep() {
    let harness = Harness::new(Vec::new());
    let task = harness
        .service
        .generate_cve_task(USER, CveFixRequestBuilder::new().with_cve("CVE-1", &[1]).build())
        .await
        .unwrap();
    harness.store.init_cve_task(&task.task_id, &[]).await.unwrap();
    harness.store.fail_operation("fix_task_status");

    let corrections = sweeper(&harness, 1)
        .sweep_once(task.create_time + 60)
        .await
        .unwrap();
    assert!(corrections.is_empty());
}

#[tokio::test]
async fn background_loop_corrects_on_its_own() {
    let harness = Harness::new(Vec::new());
    let task = harness
        .service
        .generate_cve_task(USER, CveFixRequestBuilder::new().with_cve("CVE-1", &[1]).build())
        .await
        .unwrap();
    harness.store.init_cve_task(&task.task_id, &[]).await.unwrap();

    let sweeper = Arc::new(sweeper(&harness, 0));
    let running = tokio::spawn({
        let sweeper = Arc::clone(&sweeper);
        async move { sweeper.run().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    running.abort();

    let units = harness.store.get_cve_units(&task.task_id).await.unwrap();
    assert_eq!(units[0].status, CveHostStatus::Unknown);
}
