use shared::metrics_defs::{MetricDef, MetricType};

pub const TRIGGER_RECEIVED: MetricDef = MetricDef {
    name: "trigger.received",
    metric_type: MetricType::Counter,
    description: "Number of data entry triggers received",
};

pub const PIPELINE_DURATION: MetricDef = MetricDef {
    name: "pipeline.duration",
    metric_type: MetricType::Histogram,
    description: "Pipeline duration in seconds. Tagged with outcome.",
};

pub const SOURCE_FETCH_FAILED: MetricDef = MetricDef {
    name: "source.fetch.failed",
    metric_type: MetricType::Counter,
    description: "Number of REDCap record fetches that failed",
};

pub const SUBJECT_OPERATION: MetricDef = MetricDef {
    name: "subject.operation",
    metric_type: MetricType::Counter,
    description: "Management Portal subject operations. Tagged with status.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    TRIGGER_RECEIVED,
    PIPELINE_DURATION,
    SOURCE_FETCH_FAILED,
    SUBJECT_OPERATION,
];
