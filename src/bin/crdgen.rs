//! # CRD Generator
//!
//! Prints the CustomResourceDefinitions of every kind the controller manages as
//! one multi-document YAML stream.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/servicecatalog.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use service_catalog_controller::crd::{
    ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan,
};

fn main() {
    let crds = [
        ServiceBroker::crd(),
        ServiceClass::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
