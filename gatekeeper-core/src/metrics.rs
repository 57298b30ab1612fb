#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for server metrics
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum MsgType {
        discover,
        request,
        decline,
        release,
        offer,
        ack,
        nak,
        inform,
        unknown,
    }
    pub struct RecvStats: IntCounter {
        "message_type" => MsgType
    }
    pub struct SentStats: IntCounter {
        "message_type" => MsgType
    }
}

lazy_static! {
    /// bytes sent DHCPv4
    pub static ref DHCPV4_BYTES_SENT: IntCounter = register_int_counter!("dhcpv4_bytes_sent", "DHCPv4 bytes sent").unwrap();

    /// bytes recv DHCPv4
    pub static ref DHCPV4_BYTES_RECV: IntCounter = register_int_counter!("dhcpv4_bytes_recv", "DHCPv4 bytes recv").unwrap();

    /// histogram of response times for DHCPv4 reply
    pub static ref DHCPV4_REPLY_DURATION: HistogramVec = register_histogram_vec!(
        "dhcpv4_duration",
        "dhcpv4 duration (seconds)",
        &["type"]
    )
    .unwrap();

    pub static ref RECV_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "recv_type_counts",
        "Recv Type Counts",
        &["message_type"]
    )
    .unwrap();
    pub static ref SENT_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "sent_type_counts",
        "Sent Type Counts",
        &["message_type"]
    )
    .unwrap();

    /// aggregate count of all recv'd messages types
    pub static ref RECV_TYPE_COUNT: RecvStats = RecvStats::from(&RECV_COUNT_VEC);

    /// aggregate count of all sent messages types
    pub static ref SENT_TYPE_COUNT: SentStats = SentStats::from(&SENT_COUNT_VEC);

    /// # of total addrs available in each pool
    pub static ref TOTAL_AVAILABLE_ADDRS: IntGauge =
        register_int_gauge!("total_available_addrs", "count of total available addresses").unwrap();

    // engine metrics

    /// packets dropped before reaching the engine
    pub static ref MALFORMED_MSG_COUNT: IntCounter = register_int_counter!("malformed_msg_count", "count of dropped malformed messages").unwrap();
    /// discover that could not be answered because the pool was full
    pub static ref POOL_EXHAUSTED_COUNT: IntCounter = register_int_counter!("pool_exhausted_count", "count of discovers dropped with no free address").unwrap();
    /// stale leases taken back to serve a new device
    pub static ref RECLAIMED_ADDRS_COUNT: IntCounter = register_int_counter!("reclaimed_addrs_count", "count of stale leases reclaimed").unwrap();
    /// devices the registry knows about
    pub static ref KNOWN_DEVICES: IntGauge = register_int_gauge!("known_devices", "count of devices in the registry").unwrap();
    /// devices currently resolving against the gated subnet
    pub static ref GATED_DEVICES: IntGauge = register_int_gauge!("gated_devices", "count of devices on the gated subnet").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{DHCPV4_REPLY_DURATION, POOL_EXHAUSTED_COUNT};

    #[test]
    fn metrics_are_registered_and_exposed() {
        DHCPV4_REPLY_DURATION
            .with_label_values(&["offer"])
            .observe(0.001);
        POOL_EXHAUSTED_COUNT.inc();

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(
            names.contains("dhcpv4_duration"),
            "registered metric families: {names:?}"
        );
        assert!(
            names.contains("pool_exhausted_count"),
            "registered metric families: {names:?}"
        );
    }
}
