use std::sync::LazyLock;

use prometheus::{
    register_histogram,
    register_int_counter,
    Histogram,
    HistogramTimer,
    IntCounter,
};

static GET_CONNECTION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "coordinator_pool_get_connection_seconds",
        "Time to check a connection out of the coordinator pool"
    )
    .unwrap()
});

pub fn get_connection_timer() -> HistogramTimer {
    GET_CONNECTION_SECONDS.start_timer()
}

static CONNECTIONS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "coordinator_pool_connections_created_total",
        "Number of physical coordinator connections opened"
    )
    .unwrap()
});

pub fn log_connection_created() {
    CONNECTIONS_CREATED_TOTAL.inc();
}

static POISONED_CONNECTIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "coordinator_pool_poisoned_connections_total",
        "Connections discarded instead of being returned to the pool"
    )
    .unwrap()
});

pub fn log_poisoned_connection() {
    POISONED_CONNECTIONS_TOTAL.inc();
}

static SCHEMAS_INITIALIZED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "coordinator_schemas_initialized_total",
        "Coordination schemas bootstrapped by this process"
    )
    .unwrap()
});

pub fn log_schema_initialized() {
    SCHEMAS_INITIALIZED_TOTAL.inc();
}
