//! Metrics emitted by the dispatcher.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Inbound request duration in seconds. Tagged with route and status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const DISPATCH_DURATION: MetricDef = MetricDef {
    name: "dispatch.duration",
    metric_type: MetricType::Histogram,
    description: "Backend call duration in seconds. Tagged with dispatcher kind and outcome.",
};

pub const DISPATCH_ERRORS: MetricDef = MetricDef {
    name: "dispatch.errors",
    metric_type: MetricType::Counter,
    description: "Failed service calls. Tagged with dispatcher kind and error code.",
};

pub const SESSIONS_CREATED: MetricDef = MetricDef {
    name: "sessions.created",
    metric_type: MetricType::Counter,
    description: "Sessions created by the session initialization endpoint",
};

pub const UPLOAD_FILES: MetricDef = MetricDef {
    name: "upload.files",
    metric_type: MetricType::Counter,
    description: "Files forwarded by the upload endpoint. Tagged with outcome.",
};

pub const UPLOADS_REJECTED: MetricDef = MetricDef {
    name: "upload.rejected",
    metric_type: MetricType::Counter,
    description: "Upload batches rejected because another batch for the session was in flight",
};

pub const KEYSTORE_LOADS: MetricDef = MetricDef {
    name: "keystore.loads",
    metric_type: MetricType::Counter,
    description: "Keystore load attempts. Tagged with outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    DISPATCH_DURATION,
    DISPATCH_ERRORS,
    SESSIONS_CREATED,
    UPLOAD_FILES,
    UPLOADS_REJECTED,
    KEYSTORE_LOADS,
];
