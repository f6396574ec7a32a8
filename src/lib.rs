//! Service Catalog Controller Library
//!
//! Reconciles ServiceBroker, ServiceClass, ServicePlan, ServiceInstance and
//! ServiceBinding records against Open Service Broker endpoints.
//!
//! The reconcilers only depend on the [`store::ObjectStore`] contract and the
//! [`broker::BrokerClient`] trait, so the whole controller runs against the
//! in-memory store and a scripted broker in tests.

pub mod broker;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;
pub mod store;
