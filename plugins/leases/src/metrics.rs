//! Plugin-local metrics for subnet gating.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};

lazy_static! {
    /// Count of devices moved between subnets by `switch_subnet`
    pub static ref SUBNET_SWITCH_COUNT: IntCounter = register_int_counter!(
        "subnet_switch_count",
        "count of devices moved to another subnet by an administrator"
    ).unwrap();

    /// Count of devices moved because their stored override no longer matched
    pub static ref SUBNET_RECONCILED_COUNT: IntCounter = register_int_counter!(
        "subnet_reconciled_count",
        "count of devices moved at the start of a transaction to match their override"
    ).unwrap();

    /// Count of NAKs sent because the requested address wasn't the device's
    pub static ref ADDRESS_MISMATCH_COUNT: IntCounter = register_int_counter!(
        "address_mismatch_count",
        "count of requests NAKed for asking for an address other than the one held"
    ).unwrap();
}
