//! Prometheus metrics for the replica
//!
//! Everything is updated by the node's actor loop, so requests are counted
//! once by kind whichever transport delivered them.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Requests handled, by request kind
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Time spent handling a request on the actor, by request kind
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    pub static ref TRANSITION_COUNTER_VEC: IntCounterVec = IntCounterVec::new(
        Opts::new("state_transitions", "replica state transitions"),
        &["from", "to"]
    )
    .unwrap();

    pub static ref TERM_GAUGE_VEC: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_term", "current term"), &["member"]).unwrap();

    pub static ref COMMIT_GAUGE_VEC: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_commit_index", "commit index"), &["member"]).unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(TRANSITION_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(TERM_GAUGE_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMIT_GAUGE_VEC.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_registry_exports_replica_metrics() {
        init_registry();
        TRANSITION_COUNTER_VEC
            .with_label_values(&["follower", "candidate"])
            .inc();
        TERM_GAUGE_VEC.with_label_values(&["7"]).set(3);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&REGISTRY_INSTANCE.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("state_transitions"));
        assert!(text.contains("raft_term{member=\"7\"} 3"));
    }
}
