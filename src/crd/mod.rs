//! # Custom Resource Definitions
//!
//! CRD types for the Service Catalog Controller.
//!
//! ## Module Structure
//!
//! - `broker.rs` - ServiceBroker: where a broker lives and how its catalog is refreshed
//! - `catalog.rs` - ServiceClass and ServicePlan records materialized from a catalog
//! - `instance.rs` - ServiceInstance: a provisioned service
//! - `binding.rs` - ServiceBinding: credentials for an instance
//! - `common.rs` - Conditions, references and schema helpers shared by all kinds

mod binding;
mod broker;
mod catalog;
mod common;
mod instance;

pub use binding::{
    AddKeyTransform, AddKeysFromTransform, BindingOperation, BindingProperties,
    RemoveKeyTransform, RenameKeyTransform, SecretTransform, ServiceBinding, ServiceBindingSpec,
    ServiceBindingStatus, UnbindStatus,
};
pub use broker::{
    AuthInfo, BasicAuthConfig, BearerTokenAuthConfig, CatalogRestrictions, RelistBehavior,
    ServiceBroker, ServiceBrokerSpec, ServiceBrokerStatus,
};
pub use catalog::{
    ServiceClass, ServiceClassSpec, ServicePlan, ServicePlanSpec, ServiceCatalogEntryStatus,
};
pub use common::{
    Condition, LocalObjectReference, ParametersFromSource, SecretKeyReference, SecretReference,
    UserInfo, CONDITION_FALSE, CONDITION_TRUE,
};
pub use instance::{
    DeprovisionStatus, InstanceOperation, InstanceProperties, ServiceInstance, ServiceInstanceSpec,
    ServiceInstanceStatus,
};
