mod common;

use common::*;
use remediation_core::constants::{RepoStatus, TaskStatus};
use remediation_core::models::{ArtifactKind, TaskType};
use remediation_core::services::{
    CveTaskInfoQuery, Paging, RepoTaskInfoQuery, SortOrder, TaskListQuery, TaskSortKey,
};
use remediation_core::{ProgressStore, RemediationError, ResultCode, ResultStore};

#[tokio::test]
async fn cve_task_generation_counts_hosts_and_reboots() {
    let harness = Harness::new(Vec::new());
    let request = CveFixRequestBuilder::new()
        .with_reboot_cve("CVE-1", &[1, 2])
        .with_cve("CVE-2", &[2, 3])
        .auto_reboot(true)
        .build();

    let task = harness.service.generate_cve_task(USER, request).await.unwrap();
    assert_eq!(task.task_type, TaskType::CveFix);
    assert_eq!(task.host_num, 3);
    assert_eq!(task.need_reboot, 2);
    assert!(task.auto_reboot);

    let mut cves = harness.store.get_task_cves(&task.task_id).await.unwrap();
    cves.sort_by(|a, b| a.cve_id.cmp(&b.cve_id));
    assert!(cves[0].reboot);
    assert!(!cves[1].reboot);
    assert!(cves.iter().all(|c| c.progress == 0 && c.host_num == 2));

    let artifacts = harness
        .store
        .get_task_artifacts(&task.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifacts.username, USER);
    assert!(artifacts.log.is_empty());
}

#[tokio::test]
async fn reboot_is_dropped_without_auto_reboot() {
    let harness = Harness::new(Vec::new());
    let request = CveFixRequestBuilder::new()
        .with_reboot_cve("CVE-1", &[1])
        .build();

    let task = harness.service.generate_cve_task(USER, request).await.unwrap();
    assert_eq!(task.need_reboot, 0);
    let cves = harness.store.get_task_cves(&task.task_id).await.unwrap();
    assert!(!cves[0].reboot);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_write() {
    let harness = Harness::new(Vec::new());

    let empty = CveFixRequestBuilder::new().build();
    let err = harness.service.generate_cve_task(USER, empty).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::ParamError);

    let hostless = CveFixRequestBuilder::new().with_cve("CVE-1", &[]).build();
    let err = harness.service.generate_cve_task(USER, hostless).await.unwrap_err();
    assert!(matches!(err, RemediationError::Validation(_)));

    let err = harness
        .service
        .generate_repo_task(USER, repo_request("  ", &[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::Validation(_)));

    let tasks = harness.store.list_tasks(USER).await.unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn artifact_failure_removes_the_task() {
    let harness = Harness::new(Vec::new());
    harness.store.fail_operation("init_task_artifacts");

    let err = harness
        .service
        .generate_repo_task(USER, repo_request("update", &[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::InsertFailed(_)));
    assert_eq!(err.code(), ResultCode::DatabaseInsertError);
    assert!(harness.store.list_tasks(USER).await.unwrap().is_empty());
}

#[tokio::test]
async fn scan_task_requires_known_hosts() {
    let harness = Harness::new(Vec::new());
    register_hosts(&harness.store, "someone-else", &[1]).await;

    let err = harness
        .service
        .generate_scan_task(USER, scan_request(&[1, 2]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::NoData);
}

#[tokio::test]
async fn rollback_reports_ineligible_cves_as_missing() {
    let harness = Harness::new(vec![ok("h1", "CVE-1")]);
    let fix = harness
        .service
        .generate_cve_task(
            USER,
            CveFixRequestBuilder::new()
                .with_cve("CVE-1", &[1])
                .with_cve("CVE-2", &[1])
                .build(),
        )
        .await
        .unwrap();
    // only CVE-1 runs; CVE-2 stays unfixed and is therefore failed
    harness
        .service
        .execute_task(USER, &fix.task_id, vec!["CVE-1".to_string()])
        .await
        .unwrap();

    let eligible = harness
        .service
        .queries()
        .get_rollback_cve_list(USER, &fix.task_id)
        .await
        .unwrap();
    assert_eq!(eligible, vec!["CVE-1".to_string(), "CVE-2".to_string()]);

    let partial = harness
        .service
        .generate_rollback_task(USER, rollback_request(&fix.task_id, &["CVE-1", "CVE-9"]))
        .await
        .unwrap();
    assert_eq!(partial.code(), ResultCode::PartialSucceed);
    assert_eq!(partial.missing, vec!["CVE-9".to_string()]);
    let cves = harness
        .store
        .get_task_cves(&partial.result.task_id)
        .await
        .unwrap();
    assert_eq!(cves.len(), 1);
    assert_eq!(cves[0].cve_id, "CVE-1");
    assert_eq!(partial.result.host_num, 1);

    let err = harness
        .service
        .generate_rollback_task(USER, rollback_request(&fix.task_id, &["CVE-9"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));
}

#[tokio::test]
async fn rollback_of_a_non_fix_task_is_rejected() {
    let harness = Harness::new(Vec::new());
    let repo = harness
        .service
        .generate_repo_task(USER, repo_request("update", &[1]))
        .await
        .unwrap();

    let err = harness
        .service
        .queries()
        .get_rollback_cve_list(USER, &repo.task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::Validation(_)));
}

#[tokio::test]
async fn task_list_filters_sorts_and_pages() {
    let harness = Harness::new(Vec::new());
    for hosts in [&[1][..], &[1, 2, 3][..], &[1, 2][..]] {
        harness
            .service
            .generate_cve_task(
                USER,
                CveFixRequestBuilder::new()
                    .with_name("nightly fix")
                    .with_cve("CVE-1", hosts)
                    .build(),
            )
            .await
            .unwrap();
    }
    harness
        .service
        .generate_repo_task(USER, repo_request("update", &[4]))
        .await
        .unwrap();

    let queries = harness.service.queries();
    let all = queries
        .get_task_list(USER, &TaskListQuery::default())
        .await
        .unwrap();
    assert_eq!(all.total_count, 4);
    assert_eq!(all.total_page, 1);

    let query = TaskListQuery {
        task_name: Some("nightly".to_string()),
        task_type: Some(vec![TaskType::CveFix]),
        sort: Some(TaskSortKey::HostNum),
        order: SortOrder::Desc,
        paging: Paging {
            page: Some(1),
            per_page: Some(2),
        },
    };
    let page = queries.get_task_list(USER, &query).await.unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.total_page, 2);
    let host_nums: Vec<i64> = page.result.iter().map(|t| t.host_num).collect();
    assert_eq!(host_nums, vec![3, 2]);

    let other_user = queries
        .get_task_list("guest", &TaskListQuery::default())
        .await
        .unwrap();
    assert_eq!(other_user.total_count, 0);
    assert_eq!(other_user.total_page, 0);
}

#[tokio::test]
async fn cve_task_info_applies_status_filter() {
    let harness = Harness::new(vec![ok("h1", "CVE-1"), failed("h1", "CVE-2")]);
    let task = harness
        .service
        .generate_cve_task(
            USER,
            CveFixRequestBuilder::new()
                .with_cve("CVE-1", &[1])
                .with_cve("CVE-2", &[1])
                .build(),
        )
        .await
        .unwrap();
    harness
        .service
        .execute_task(USER, &task.task_id, Vec::new())
        .await
        .unwrap();

    let queries = harness.service.queries();
    let failed_only = CveTaskInfoQuery {
        status: Some(vec![TaskStatus::Fail]),
        ..Default::default()
    };
    let page = queries
        .get_cve_task_info(USER, &task.task_id, &failed_only)
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.result[0].cve_id, "CVE-2");
    assert_eq!(page.result[0].package, "cve-2-pkg");

    let nothing = CveTaskInfoQuery {
        status: Some(Vec::new()),
        ..Default::default()
    };
    let page = queries
        .get_cve_task_info(USER, &task.task_id, &nothing)
        .await
        .unwrap();
    assert_eq!(page.total_count, 0);
    assert!(page.result.is_empty());

    let narrowed = queries
        .get_task_cve_result(USER, &task.task_id, &["CVE-2".to_string()])
        .await
        .unwrap();
    let cves = narrowed.task_result[0].cves.as_ref().unwrap();
    assert_eq!(cves.len(), 1);
    assert_eq!(cves[0].result, "unfixed");
    assert_eq!(cves[0].log, "command failed");
}

#[tokio::test]
async fn task_progress_counts_hosts_and_reports_missing_tasks() {
    let harness = Harness::new(vec![ok("h1", "set repo"), failed("h2", "set repo")]);
    let task = harness
        .service
        .generate_repo_task(USER, repo_request("update", &[1, 2, 3]))
        .await
        .unwrap();
    harness
        .service
        .execute_task(USER, &task.task_id, Vec::new())
        .await
        .unwrap();

    let progress = harness
        .service
        .queries()
        .get_task_progress(USER, &[task.task_id.clone(), "gone".to_string()])
        .await
        .unwrap();
    assert_eq!(progress.missing, vec!["gone".to_string()]);
    let counts = progress.result[&task.task_id];
    assert_eq!(counts.succeed, 1);
    assert_eq!(counts.fail, 1);
    assert_eq!(counts.unknown, 1);
    assert_eq!(counts.running, 0);

    let set_only = RepoTaskInfoQuery {
        status: Some(vec![RepoStatus::Set]),
        ..Default::default()
    };
    let page = harness
        .service
        .queries()
        .get_repo_task_info(USER, &task.task_id, &set_only)
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.result[0].host_id, 1);

    let err = harness
        .service
        .queries()
        .get_task_progress(USER, &["gone".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::NoData);
}

#[tokio::test]
async fn playbook_artifacts_are_stored_at_execution() {
    let harness = Harness::new(vec![ok("h1", "CVE-1")]);
    let task = harness
        .service
        .generate_cve_task(USER, CveFixRequestBuilder::new().with_cve("CVE-1", &[1]).build())
        .await
        .unwrap();

    let err = harness
        .service
        .queries()
        .get_task_cve_result(USER, &task.task_id, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));

    harness
        .service
        .execute_task(USER, &task.task_id, Vec::new())
        .await
        .unwrap();

    let queries = harness.service.queries();
    let playbook = queries
        .get_task_ansible_info(USER, &task.task_id, ArtifactKind::Playbook)
        .await
        .unwrap();
    assert!(playbook.contains("yum upgrade -y --cve=CVE-1"));
    let inventory = queries
        .get_task_ansible_info(USER, &task.task_id, ArtifactKind::Inventory)
        .await
        .unwrap();
    assert!(inventory.contains("10.0.0.1"));
    let log = queries
        .get_task_ansible_info(USER, &task.task_id, ArtifactKind::Log)
        .await
        .unwrap();
    assert!(log.contains(&task.task_id));
}

#[tokio::test]
async fn delete_removes_units_documents_and_cache() {
    let harness = Harness::new(vec![ok("h1", "CVE-1")]);
    let task = harness
        .service
        .generate_cve_task(USER, CveFixRequestBuilder::new().with_cve("CVE-1", &[1]).build())
        .await
        .unwrap();
    harness
        .service
        .execute_task(USER, &task.task_id, Vec::new())
        .await
        .unwrap();
    assert!(harness.service.cache().get(&task.task_id).is_some());

    let deleted = harness
        .service
        .delete_task(USER, &[task.task_id.clone(), "gone".to_string()])
        .await
        .unwrap();
    assert_eq!(deleted.result, vec![task.task_id.clone()]);
    assert_eq!(deleted.missing, vec!["gone".to_string()]);

    assert!(harness.store.get_cve_units(&task.task_id).await.unwrap().is_empty());
    assert!(harness
        .store
        .get_task_artifacts(&task.task_id)
        .await
        .unwrap()
        .is_none());
    assert!(harness.service.cache().get(&task.task_id).is_none());

    let err = harness
        .service
        .queries()
        .get_task_info(USER, &task.task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));
}

#[tokio::test]
async fn tasks_are_invisible_to_other_users() {
    let harness = Harness::new(Vec::new());
    let task = harness
        .service
        .generate_cve_task(USER, CveFixRequestBuilder::new().with_cve("CVE-1", &[1]).build())
        .await
        .unwrap();

    let err = harness
        .service
        .delete_task("guest", &[task.task_id.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));

    let err = harness
        .service
        .execute_task("guest", &task.task_id, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));
    assert_eq!(harness.runner.runs(), 0);
}

#[tokio::test]
async fn callback_for_idle_task_is_not_found() {
    let harness = Harness::new(Vec::new());
    let err = harness
        .service
        .receive_callback("no-such-task", ok("h1", "CVE-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemediationError::NotFound(_)));
}
