//! ServiceBroker catalog sync against a scripted broker

mod common;

use common::{
    broker_spec, catalog, http_error, instance_spec, secret, Harness, Script, CLASS_EXTERNAL_NAME,
    CLASS_ID, NAMESPACE, NONBINDABLE_PLAN_ID, PLAN_EXTERNAL_NAME, PLAN_ID,
};
use kube::ResourceExt;
use service_catalog_controller::broker::BrokerAuth;
use service_catalog_controller::controller::status::{reason, ConditionedStatus};
use service_catalog_controller::crd::{
    AuthInfo, BasicAuthConfig, CatalogRestrictions, SecretReference,
};

#[tokio::test]
async fn test_sync_materializes_classes_and_plans() {
    let h = Harness::start();
    let broker = h.create_ready_broker().await;

    let status = broker.status.as_ref().unwrap();
    assert_eq!(status.ready_reason(), Some(reason::FETCHED_CATALOG));
    assert_eq!(status.observed_generation, broker.metadata.generation);
    assert!(status.last_catalog_retrieval_time.is_some());

    let classes = h.classes().await;
    assert_eq!(classes.len(), 1);
    let class = &classes[0];
    assert_eq!(class.name_any(), CLASS_ID);
    assert_eq!(class.namespace().as_deref(), Some(NAMESPACE));
    assert_eq!(class.spec.external_name, CLASS_EXTERNAL_NAME);
    assert_eq!(class.spec.broker_name, "test-broker");
    assert!(class.spec.bindable);
    assert!(class.spec.plan_updatable);

    let plans = h.plans().await;
    assert_eq!(plans.len(), 2);
    let plan = h.plan_by_external_id(PLAN_ID).await.unwrap();
    assert_eq!(plan.spec.external_name, PLAN_EXTERNAL_NAME);
    assert_eq!(plan.spec.service_class_ref, CLASS_ID);
    assert!(plan.spec.free);
    let unbindable = h.plan_by_external_id(NONBINDABLE_PLAN_ID).await.unwrap();
    assert_eq!(unbindable.spec.bindable, Some(false));

    h.stop().await;
}

#[tokio::test]
async fn test_restrictions_filter_plans() {
    let h = Harness::start();
    let mut spec = broker_spec();
    spec.catalog_restrictions = Some(CatalogRestrictions {
        service_class: Vec::new(),
        service_plan: vec![format!("spec.externalName in ({PLAN_EXTERNAL_NAME})")],
    });
    h.create_broker(spec).await;
    h.wait_broker_reason(reason::FETCHED_CATALOG).await;

    assert_eq!(h.classes().await.len(), 1);
    let plans = h.plans().await;
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].spec.external_id, PLAN_ID);

    h.stop().await;
}

#[tokio::test]
async fn test_malformed_restriction_is_reported() {
    let h = Harness::start();
    let mut spec = broker_spec();
    spec.catalog_restrictions = Some(CatalogRestrictions {
        service_class: vec!["spec.color=blue".to_string()],
        service_plan: Vec::new(),
    });
    h.create_broker(spec).await;

    let broker = h.wait_broker_reason(reason::ERROR_SYNCING_CATALOG).await;
    assert!(!broker.status.as_ref().unwrap().is_ready());
    assert!(h.classes().await.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_removed_plan_is_kept_while_referenced() {
    let h = Harness::start();
    h.create_ready_broker().await;
    h.create_instance("db", instance_spec(PLAN_EXTERNAL_NAME)).await;
    h.wait_instance_ready("db").await;

    let mut trimmed = catalog();
    trimmed.services[0].plans.retain(|p| p.id != PLAN_ID);
    h.broker.script(|s| s.catalog = Script::always(Ok(trimmed)));
    h.edit_broker(|b| b.spec.relist_requests += 1).await;

    h.wait_broker(|b| {
        b.status
            .as_ref()
            .is_some_and(|s| s.last_observed_relist_requests == Some(1))
    })
    .await;
    let plan = h.plan_by_external_id(PLAN_ID).await.unwrap();
    assert!(plan.is_removed());

    h.delete_instance("db").await;
    h.wait_instance_gone("db").await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while h.plan_by_external_id(PLAN_ID).await.is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "removed plan was never collected"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(h.plan_by_external_id(NONBINDABLE_PLAN_ID).await.is_some());

    h.stop().await;
}

#[tokio::test]
async fn test_removed_plan_cannot_be_provisioned() {
    let h = Harness::start();
    h.create_ready_broker().await;
    h.create_instance("db", instance_spec(PLAN_EXTERNAL_NAME)).await;
    h.wait_instance_ready("db").await;

    let mut trimmed = catalog();
    trimmed.services[0].plans.retain(|p| p.id != PLAN_ID);
    h.broker.script(|s| s.catalog = Script::always(Ok(trimmed)));
    h.edit_broker(|b| b.spec.relist_requests += 1).await;
    h.wait_broker(|b| {
        b.status
            .as_ref()
            .is_some_and(|s| s.last_observed_relist_requests == Some(1))
    })
    .await;

    h.create_instance("db2", instance_spec(PLAN_EXTERNAL_NAME)).await;
    let instance = h
        .wait_instance_reason("db2", reason::ERROR_DELETED_SERVICE_PLAN)
        .await;
    assert!(instance.status.as_ref().unwrap().is_failed());
    assert_eq!(h.broker.provisions().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_broker_deletion_cleans_up_the_catalog() {
    let h = Harness::start();
    h.create_ready_broker().await;
    assert_eq!(h.plans().await.len(), 2);

    h.delete_broker().await;
    h.wait_broker_gone().await;

    assert!(h.classes().await.is_empty());
    assert!(h.plans().await.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_fetch_error_is_reported_then_retried() {
    let h = Harness::start();
    h.broker.script(|s| {
        let mut steps: Vec<_> = (0..5).map(|_| Err(http_error(503))).collect();
        steps.push(Ok(catalog()));
        s.catalog = Script::steps(steps);
    });
    h.create_broker(broker_spec()).await;

    h.wait_broker_reason(reason::ERROR_FETCHING_CATALOG).await;
    assert!(h.classes().await.is_empty());

    h.wait_broker_reason(reason::FETCHED_CATALOG).await;
    assert_eq!(h.classes().await.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_missing_auth_secret_recovers_once_created() {
    let h = Harness::start();
    let mut spec = broker_spec();
    spec.auth_info = Some(AuthInfo {
        basic: Some(BasicAuthConfig {
            secret_ref: SecretReference {
                name: "broker-auth".to_string(),
                namespace: None,
            },
        }),
        bearer: None,
    });
    h.create_broker(spec).await;

    h.wait_broker_reason(reason::ERROR_GETTING_AUTH_CREDENTIALS)
        .await;
    assert!(h.broker.calls().is_empty());

    h.create_secret(&secret("broker-auth", &[("username", "admin"), ("password", "s3cret")]))
        .await;
    h.wait_broker_reason(reason::FETCHED_CATALOG).await;

    let configs = h.factory.configs.lock().unwrap().clone();
    assert_eq!(
        configs.last().unwrap().auth,
        Some(BrokerAuth::Basic {
            username: "admin".to_string(),
            password: "s3cret".to_string(),
        })
    );

    h.stop().await;
}
