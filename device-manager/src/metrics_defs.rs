//! Metrics definitions for the device manager.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DEVICE_ASSIGNED: MetricDef = MetricDef {
    name: "device_manager.device.assigned",
    metric_type: MetricType::Counter,
    description: "Number of devices assigned to a user",
};

pub const DEVICE_UNASSIGNED: MetricDef = MetricDef {
    name: "device_manager.device.unassigned",
    metric_type: MetricType::Counter,
    description: "Number of devices whose assignment was removed",
};

pub const ASSIGNMENT_CONFLICT: MetricDef = MetricDef {
    name: "device_manager.assignment.conflict",
    metric_type: MetricType::Counter,
    description: "Reassignments that lost the ledger write to a concurrent request",
};

pub const ASSIGNMENT_RECOVERED: MetricDef = MetricDef {
    name: "device_manager.assignment.recovered",
    metric_type: MetricType::Counter,
    description: "Interrupted reassignments repaired on a later access",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "device_manager.reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete an assign or reassign in seconds",
};

pub const STORE_SCAN_PAGES: MetricDef = MetricDef {
    name: "device_manager.store.scan_pages",
    metric_type: MetricType::Histogram,
    description: "Number of pages read by a full device table scan",
};

pub const API_ERRORS: MetricDef = MetricDef {
    name: "device_manager.api.errors",
    metric_type: MetricType::Counter,
    description: "API requests answered with an error status",
};

pub const ALL_METRICS: &[MetricDef] = &[
    DEVICE_ASSIGNED,
    DEVICE_UNASSIGNED,
    ASSIGNMENT_CONFLICT,
    ASSIGNMENT_RECOVERED,
    RECONCILE_DURATION,
    STORE_SCAN_PAGES,
    API_ERRORS,
];
