//! # Catalog Synchronizer
//!
//! - `relist`: when a broker's catalog is fetched again
//! - `restrictions`: which catalog entries are materialized
//! - `sync`: fetching the catalog and writing ServiceClass / ServicePlan records

pub mod relist;
pub mod restrictions;
pub mod sync;

pub use relist::{next_relist_delay, parse_relist_duration, relist_trigger, RelistTrigger};
pub use restrictions::{Restriction, RestrictionError};
pub use sync::{apply_catalog, fetch_catalog, CatalogFetchError, CatalogFilter, SyncSummary};

use crate::crd::ServiceBroker;

/// Parse the catalog restrictions of a broker
///
/// # Errors
///
/// Returns [`RestrictionError`] for malformed predicates.
pub fn catalog_filter(broker: &ServiceBroker) -> Result<CatalogFilter, RestrictionError> {
    let Some(restrictions) = broker.spec.catalog_restrictions.as_ref() else {
        return Ok(CatalogFilter::default());
    };
    Ok(CatalogFilter {
        classes: Restriction::for_classes(&restrictions.service_class)?,
        plans: Restriction::for_plans(&restrictions.service_plan)?,
    })
}
