use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Resources served from the object store. Tagged with scope.",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Cache lookups that found no usable object. Tagged with scope.",
};

pub const CACHE_READ_ERROR: MetricDef = MetricDef {
    name: "cache.read_error",
    metric_type: MetricType::Counter,
    description: "Lookup or read failures that were degraded to a miss. Tagged with scope.",
};

pub const CACHE_WRITE_ERROR: MetricDef = MetricDef {
    name: "cache.write_error",
    metric_type: MetricType::Counter,
    description: "Background cache writes that failed or timed out. Tagged with scope.",
};

pub const RACE_DURATION: MetricDef = MetricDef {
    name: "race.duration",
    metric_type: MetricType::Histogram,
    description: "Time until a race produced a result in seconds. Tagged with operation, outcome.",
};

pub const RACE_ATTEMPTS: MetricDef = MetricDef {
    name: "race.attempts",
    metric_type: MetricType::Histogram,
    description: "Number of attempts launched per race. Tagged with operation.",
};

pub const ARCHIVE_ENTRIES: MetricDef = MetricDef {
    name: "archive.entries",
    metric_type: MetricType::Counter,
    description: "Entries written into streamed archives",
};

pub const ARCHIVE_ABORTED: MetricDef = MetricDef {
    name: "archive.aborted",
    metric_type: MetricType::Counter,
    description: "Archive jobs terminated before the central directory was written. Tagged with reason.",
};

pub const ARCHIVE_IN_FLIGHT: MetricDef = MetricDef {
    name: "archive.pipelines_inflight",
    metric_type: MetricType::Gauge,
    description: "Archive item pipelines currently holding a concurrency permit",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    CACHE_READ_ERROR,
    CACHE_WRITE_ERROR,
    RACE_DURATION,
    RACE_ATTEMPTS,
    ARCHIVE_ENTRIES,
    ARCHIVE_ABORTED,
    ARCHIVE_IN_FLIGHT,
];
