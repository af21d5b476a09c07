//! Integration tests for the audit log store
//!
//! State machine guards, metadata merging, placeholder logs, queries and
//! retention cleanup.

mod helpers;

use chrono::Duration;
use serde_json::json;
use serde_json::Map;

use enrich_audit::audit_log::TEMP_AUDITABLE_KEY;
use enrich_audit::{AuditPolicy, AuditStatus, LifecycleEvent, NewAuditLog, AUTOMATIC_AUDIT_SERVICE};
use enrich_common::{Clock, EntityKind, EntityRef, Error};
use helpers::{as_map, insert_entities, test_env};

#[tokio::test]
async fn test_create_pending_populates_record_reference() {
    let env = test_env().await;
    let domain = EntityRef::domain(42);

    let log_id = env
        .store
        .create_pending(
            NewAuditLog::for_entity(domain, "domain_dns_testing")
                .operation("update")
                .columns(["dns_status"])
                .metadata(as_map(json!({ "resolver": "1.1.1.1" }))),
        )
        .await
        .unwrap();

    let log = env.store.get(log_id).await.unwrap().unwrap();
    assert_eq!(log.status, AuditStatus::Pending);
    assert_eq!(log.entity(), Some(domain));
    assert_eq!(log.table_name, "domains");
    assert_eq!(log.record_id, "42");
    assert_eq!(log.operation_type, "update");
    assert_eq!(log.started_at, env.clock.now());
    assert!(log.completed_at.is_none());
    assert!(log.error_message.is_none());
    assert_eq!(log.columns_affected, vec!["dns_status"]);
}

#[tokio::test]
async fn test_create_pending_rejects_missing_service_name() {
    let env = test_env().await;

    let result = env
        .store
        .create_pending(NewAuditLog::for_entity(EntityRef::company(1), ""))
        .await;

    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_mark_success_merges_metadata_and_columns() {
    let env = test_env().await;
    let log_id = env
        .store
        .create_pending(
            NewAuditLog::for_entity(EntityRef::domain(7), "domain_mx_testing")
                .columns(["mx_records"])
                .metadata(as_map(json!({ "attempt": 1, "source": "scheduler" }))),
        )
        .await
        .unwrap();

    env.clock.advance(Duration::milliseconds(1500));

    let log = env
        .store
        .mark_success(
            log_id,
            as_map(json!({ "attempt": 2, "mx_count": 3 })),
            vec!["mx_records".to_string(), "mx_status".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(log.status, AuditStatus::Success);
    assert_eq!(log.completed_at, Some(env.clock.now()));
    assert_eq!(log.execution_time_ms, Some(1500));
    assert_eq!(log.metadata["attempt"], json!(2));
    assert_eq!(log.metadata["source"], json!("scheduler"));
    assert_eq!(log.metadata["mx_count"], json!(3));
    assert_eq!(log.columns_affected, vec!["mx_records", "mx_status"]);
}

#[tokio::test]
async fn test_mark_failed_records_error() {
    let env = test_env().await;
    let log_id = env
        .store
        .create_pending(NewAuditLog::for_entity(EntityRef::domain(7), "domain_dns_testing"))
        .await
        .unwrap();

    let log = env
        .store
        .mark_failed(log_id, "DNS timeout", Map::new(), Vec::new())
        .await
        .unwrap();

    assert_eq!(log.status, AuditStatus::Failed);
    assert_eq!(log.error_message.as_deref(), Some("DNS timeout"));
    assert_eq!(log.metadata["error"], json!("DNS timeout"));
    assert!(log.completed_at.is_some());
}

#[tokio::test]
async fn test_second_terminalization_is_illegal_state() {
    let env = test_env().await;
    let log_id = env
        .store
        .create_pending(NewAuditLog::for_entity(EntityRef::company(1), "company_financials"))
        .await
        .unwrap();

    env.store.mark_success(log_id, Map::new(), Vec::new()).await.unwrap();

    let again = env.store.mark_success(log_id, Map::new(), Vec::new()).await;
    assert!(matches!(again, Err(Error::IllegalState(_))));

    let flip = env.store.mark_failed(log_id, "late failure", Map::new(), Vec::new()).await;
    assert!(matches!(flip, Err(Error::IllegalState(_))));

    // The terminal row is untouched
    let log = env.store.get(log_id).await.unwrap().unwrap();
    assert_eq!(log.status, AuditStatus::Success);
    assert!(log.error_message.is_none());
}

#[tokio::test]
async fn test_terminalize_unknown_log_is_not_found() {
    let env = test_env().await;

    let result = env.store.mark_success(9999, Map::new(), Vec::new()).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_placeholder_log_attached_later() {
    let env = test_env().await;
    insert_entities(&env.pool, EntityKind::Company, &[15]).await;
    let registry = env.registry();

    let log_id = env
        .store
        .create_unresolved(
            EntityKind::Company,
            "phantom_buster_webhooks",
            "container-8841",
            "phantom_buster_webhook",
            "process_webhook",
            as_map(json!({ "container_id": "8841" })),
        )
        .await
        .unwrap();

    let placeholder = env.store.get(log_id).await.unwrap().unwrap();
    assert!(placeholder.is_placeholder());
    assert_eq!(placeholder.table_name, "phantom_buster_webhooks");
    assert_eq!(placeholder.record_id, "container-8841");
    assert_eq!(placeholder.metadata[TEMP_AUDITABLE_KEY], json!(true));

    // Unknown entity cannot be attached
    let missing = env
        .store
        .attach_entity(log_id, EntityRef::company(99), &registry)
        .await;
    assert!(matches!(missing, Err(Error::NotFound(_))));

    let attached = env
        .store
        .attach_entity(log_id, EntityRef::company(15), &registry)
        .await
        .unwrap();
    assert_eq!(attached.entity(), Some(EntityRef::company(15)));
    assert!(!attached.metadata.contains_key(TEMP_AUDITABLE_KEY));
    assert_eq!(attached.metadata["container_id"], json!("8841"));
    assert_eq!(attached.record_id, "container-8841");
}

#[tokio::test]
async fn test_attach_rejects_kind_mismatch_and_reattachment() {
    let env = test_env().await;
    insert_entities(&env.pool, EntityKind::Company, &[1, 2]).await;
    insert_entities(&env.pool, EntityKind::Person, &[1]).await;
    let registry = env.registry();

    let log_id = env
        .store
        .create_unresolved(EntityKind::Company, "webhooks", "w1", "svc", "process_webhook", Map::new())
        .await
        .unwrap();

    let wrong_kind = env.store.attach_entity(log_id, EntityRef::person(1), &registry).await;
    assert!(matches!(wrong_kind, Err(Error::Validation(_))));

    env.store
        .attach_entity(log_id, EntityRef::company(1), &registry)
        .await
        .unwrap();
    // Same entity again is a no-op
    env.store
        .attach_entity(log_id, EntityRef::company(1), &registry)
        .await
        .unwrap();

    let other = env.store.attach_entity(log_id, EntityRef::company(2), &registry).await;
    assert!(matches!(other, Err(Error::IllegalState(_))));
}

#[tokio::test]
async fn test_queries_and_stats() {
    let env = test_env().await;
    let domain = EntityRef::domain(3);

    let first = env
        .store
        .create_pending(NewAuditLog::for_entity(domain, "domain_dns_testing"))
        .await
        .unwrap();
    env.clock.advance(Duration::milliseconds(200));
    env.store.mark_success(first, Map::new(), Vec::new()).await.unwrap();

    env.clock.advance(Duration::hours(1));
    let second = env
        .store
        .create_pending(NewAuditLog::for_entity(domain, "domain_dns_testing"))
        .await
        .unwrap();
    env.clock.advance(Duration::milliseconds(400));
    env.store.mark_failed(second, "SERVFAIL", Map::new(), Vec::new()).await.unwrap();

    env.store
        .create_pending(NewAuditLog::for_entity(domain, "domain_mx_testing"))
        .await
        .unwrap();

    let all = env.store.logs_for(domain, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].service_name, "domain_mx_testing");

    let dns = env.store.logs_for(domain, Some("domain_dns_testing")).await.unwrap();
    assert_eq!(dns.iter().map(|l| l.id).collect::<Vec<_>>(), vec![second, first]);

    let last = env
        .store
        .last_successful_run(domain, "domain_dns_testing")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.id, first);

    let stats = env.store.service_stats("domain_dns_testing").await.unwrap();
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total(), 2);
    assert_eq!(stats.avg_execution_time_ms, Some(300.0));
    assert_eq!(stats.last_success_at, last.completed_at);

    let recent = env.store.recent(2).await.unwrap();
    assert_eq!(recent.len(), 2);
}

#[tokio::test]
async fn test_stats_for_unknown_service_are_zero() {
    let env = test_env().await;

    let stats = env.store.service_stats("never_ran").await.unwrap();
    assert_eq!(stats.total(), 0);
    assert!(stats.avg_execution_time_ms.is_none());
    assert!(stats.last_success_at.is_none());
}

#[tokio::test]
async fn test_cleanup_removes_only_old_logs() {
    let env = test_env().await;

    env.store
        .create_pending(NewAuditLog::for_entity(EntityRef::company(1), "svc"))
        .await
        .unwrap();
    env.clock.advance(Duration::days(91));
    let fresh = env
        .store
        .create_pending(NewAuditLog::for_entity(EntityRef::company(1), "svc"))
        .await
        .unwrap();

    let removed = env.store.cleanup_old_logs(90).await.unwrap();
    assert_eq!(removed, 1);

    let remaining = env.store.logs_for(EntityRef::company(1), None).await.unwrap();
    assert_eq!(remaining.iter().map(|l| l.id).collect::<Vec<_>>(), vec![fresh]);
}

#[tokio::test]
async fn test_lifecycle_logs_follow_policy() {
    let env = test_env().await;
    let company = EntityRef::company(5);

    let created = env
        .store
        .record_lifecycle(company, LifecycleEvent::Created, AuditPolicy::ENABLED)
        .await
        .unwrap()
        .unwrap();
    let log = env.store.get(created).await.unwrap().unwrap();
    assert_eq!(log.service_name, AUTOMATIC_AUDIT_SERVICE);
    assert_eq!(log.operation_type, "create");
    assert_eq!(log.status, AuditStatus::Success);
    assert_eq!(log.metadata["model_class"], json!("Company"));
    assert_eq!(log.metadata["record_id"], json!(5));

    let changes = as_map(json!({ "website": [null, "https://acme.no"] }));
    let updated = env
        .store
        .record_lifecycle(company, LifecycleEvent::Updated { changes }, AuditPolicy::ENABLED)
        .await
        .unwrap()
        .unwrap();
    let log = env.store.get(updated).await.unwrap().unwrap();
    assert_eq!(log.operation_type, "update");
    assert_eq!(log.columns_affected, vec!["website"]);
    assert_eq!(log.metadata["changes"]["website"][1], json!("https://acme.no"));

    // No changes, nothing recorded
    let noop = env
        .store
        .record_lifecycle(company, LifecycleEvent::Updated { changes: Map::new() }, AuditPolicy::ENABLED)
        .await
        .unwrap();
    assert!(noop.is_none());

    let disabled = env
        .store
        .record_lifecycle(company, LifecycleEvent::Created, AuditPolicy::DISABLED)
        .await
        .unwrap();
    assert!(disabled.is_none());

    assert_eq!(env.store.logs_for(company, None).await.unwrap().len(), 2);
}
