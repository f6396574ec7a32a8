//! # CRD Validation Tests
//!
//! Sample manifests for every kind must deserialize, and the generated CRDs must
//! keep their names, scope and status subresource. Status bodies are sent as
//! merge patches, so cleared fields must serialize as explicit nulls.

use kube::CustomResourceExt;
use service_catalog_controller::crd::{
    BindingProperties, InstanceProperties, RelistBehavior, ServiceBinding, ServiceBindingStatus,
    ServiceBroker, ServiceClass, ServiceInstance, ServiceInstanceStatus, ServicePlan,
};

#[test]
fn test_broker_with_basic_auth_and_restrictions() {
    let yaml = r#"
apiVersion: servicecatalog.octopilot.io/v1beta1
kind: ServiceBroker
metadata:
  name: ups-broker
  namespace: team-a
spec:
  url: https://broker.example.com
  caBundle: LS0tLS1CRUdJTi0tLS0t
  authInfo:
    basic:
      secretRef:
        name: broker-auth
  relistBehavior: Duration
  relistDuration: 30m
  catalogRestrictions:
    serviceClass:
      - "spec.externalName in (postgres,redis)"
    servicePlan:
      - "spec.free=true"
"#;

    let broker: ServiceBroker = serde_yaml::from_str(yaml).expect("Should deserialize broker");
    assert_eq!(broker.spec.url, "https://broker.example.com");
    assert_eq!(broker.spec.relist_behavior, RelistBehavior::Duration);
    assert_eq!(broker.spec.relist_duration, "30m");
    assert_eq!(broker.spec.relist_requests, 0);
    assert!(!broker.spec.insecure_skip_tls_verify);
    let auth = broker.spec.auth_info.as_ref().unwrap();
    assert_eq!(auth.secret_ref().unwrap().name, "broker-auth");
    let restrictions = broker.spec.catalog_restrictions.as_ref().unwrap();
    assert_eq!(restrictions.service_class.len(), 1);
    assert_eq!(restrictions.service_plan, vec!["spec.free=true".to_string()]);
}

#[test]
fn test_broker_defaults() {
    let yaml = r#"
apiVersion: servicecatalog.octopilot.io/v1beta1
kind: ServiceBroker
metadata:
  name: minimal
spec:
  url: http://broker.svc
"#;

    let broker: ServiceBroker = serde_yaml::from_str(yaml).expect("Should deserialize broker");
    assert_eq!(broker.spec.relist_behavior, RelistBehavior::Duration);
    assert_eq!(broker.spec.relist_duration, "15m");
    assert!(broker.spec.auth_info.is_none());
    assert!(broker.spec.catalog_restrictions.is_none());
}

#[test]
fn test_instance_with_parameters_from_and_user_info() {
    let yaml = r#"
apiVersion: servicecatalog.octopilot.io/v1beta1
kind: ServiceInstance
metadata:
  name: db
  namespace: team-a
spec:
  serviceClassExternalName: postgres
  servicePlanExternalName: small
  externalID: 6a1c1f64-3b9b-4d6c-9a55-2a5f8a2e1c11
  parameters:
    version: "16"
    extensions: [pgcrypto]
  parametersFrom:
    - secretKeyRef:
        name: db-params
        key: params
  userInfo:
    username: alice
    groups: [devs]
"#;

    let instance: ServiceInstance =
        serde_yaml::from_str(yaml).expect("Should deserialize instance");
    assert_eq!(instance.spec.service_class_external_name.as_deref(), Some("postgres"));
    assert_eq!(
        instance.spec.external_id.as_deref(),
        Some("6a1c1f64-3b9b-4d6c-9a55-2a5f8a2e1c11")
    );
    let parameters = instance.spec.parameters.as_ref().unwrap();
    assert_eq!(parameters["version"], "16");
    assert_eq!(parameters["extensions"][0], "pgcrypto");
    let source = instance.spec.parameters_from[0].secret_key_ref.as_ref().unwrap();
    assert_eq!(source.name, "db-params");
    assert_eq!(source.key, "params");
    let user = instance.spec.user_info.as_ref().unwrap();
    assert_eq!(user.username, "alice");
    assert!(user.uid.is_none());
    assert_eq!(user.groups, vec!["devs".to_string()]);
}

#[test]
fn test_binding_with_secret_transforms() {
    let yaml = r#"
apiVersion: servicecatalog.octopilot.io/v1beta1
kind: ServiceBinding
metadata:
  name: db-creds
  namespace: team-a
spec:
  instanceRef:
    name: db
  secretName: app-db
  secretTransforms:
    - renameKey:
        from: uri
        to: DATABASE_URL
    - addKey:
        key: DB_HOST
        jsonPathExpression: "{.db.host}"
    - addKeysFrom:
        secretRef:
          name: shared
          namespace: platform
    - removeKey:
        key: password
"#;

    let binding: ServiceBinding = serde_yaml::from_str(yaml).expect("Should deserialize binding");
    assert_eq!(binding.spec.instance_ref.name, "db");
    assert_eq!(binding.spec.secret_name.as_deref(), Some("app-db"));
    let transforms = &binding.spec.secret_transforms;
    assert_eq!(transforms.len(), 4);
    assert_eq!(transforms[0].rename_key.as_ref().unwrap().to, "DATABASE_URL");
    assert_eq!(
        transforms[1]
            .add_key
            .as_ref()
            .unwrap()
            .json_path_expression
            .as_deref(),
        Some("{.db.host}")
    );
    let from = &transforms[2].add_keys_from.as_ref().unwrap().secret_ref;
    assert_eq!(from.namespace.as_deref(), Some("platform"));
    assert_eq!(transforms[3].remove_key.as_ref().unwrap().key, "password");
}

#[test]
fn test_generated_crds_are_namespaced_with_status() {
    let crds = [
        ServiceBroker::crd(),
        ServiceClass::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ];
    let names: Vec<_> = crds
        .iter()
        .map(|crd| crd.metadata.name.clone().unwrap_or_default())
        .collect();
    assert_eq!(
        names,
        vec![
            "servicebrokers.servicecatalog.octopilot.io",
            "serviceclasses.servicecatalog.octopilot.io",
            "serviceplans.servicecatalog.octopilot.io",
            "serviceinstances.servicecatalog.octopilot.io",
            "servicebindings.servicecatalog.octopilot.io",
        ]
    );
    for crd in &crds {
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1beta1");
        assert!(
            version
                .subresources
                .as_ref()
                .is_some_and(|s| s.status.is_some()),
            "{} has no status subresource",
            crd.spec.names.kind
        );
    }
}

#[test]
fn test_cleared_parameters_checksum_serializes_as_null() {
    let status = ServiceInstanceStatus {
        external_properties: Some(InstanceProperties {
            service_plan_external_id: "34567".to_string(),
            parameters_checksum: None,
        }),
        ..ServiceInstanceStatus::default()
    };
    let json = serde_json::to_value(&status).unwrap();
    let properties = json["externalProperties"].as_object().unwrap();
    assert!(
        properties
            .get("parametersChecksum")
            .is_some_and(serde_json::Value::is_null),
        "a merge patch without the key would keep the previous checksum"
    );

    let status = ServiceBindingStatus {
        external_properties: Some(BindingProperties {
            parameters_checksum: None,
        }),
        ..ServiceBindingStatus::default()
    };
    let json = serde_json::to_value(&status).unwrap();
    let properties = json["externalProperties"].as_object().unwrap();
    assert!(properties
        .get("parametersChecksum")
        .is_some_and(serde_json::Value::is_null));
}
