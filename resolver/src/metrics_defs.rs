//! Metrics definitions for the service call resolver.

use shared::metrics_defs::{MetricDef, MetricType};

pub const ADDRESS_RESOLVED: MetricDef = MetricDef {
    name: "resolver.resolved",
    metric_type: MetricType::Counter,
    description: "Addresses resolved from a logical service name to a URL",
};

pub const ADDRESS_PASSTHROUGH: MetricDef = MetricDef {
    name: "resolver.passthrough",
    metric_type: MetricType::Counter,
    description: "Addresses returned unchanged because they do not start with the prefix",
};

pub const ADDRESS_UNRESOLVABLE: MetricDef = MetricDef {
    name: "resolver.unresolvable",
    metric_type: MetricType::Counter,
    description: "Logical service names with no configured URL",
};

pub const ALL_METRICS: &[MetricDef] = &[ADDRESS_RESOLVED, ADDRESS_PASSTHROUGH, ADDRESS_UNRESOLVABLE];
