pub const ROUTER_MAX_CONN: &str = "router_max_connections";
pub const ROUTER_CURR_CONN: &str = "router_curr_connections";
pub const ROUTER_COM_LATENCY: &str = "router_com_latency";
pub const POOL_IDLE_CONN: &str = "router_pool_idle_connections";
pub const POOL_STASHED_CONN: &str = "router_pool_stashed_connections";
pub const POOL_REUSED_TOTAL: &str = "router_pool_reused_total";
pub const POOL_CLOSED_TOTAL: &str = "router_pool_closed_total";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { RouterMaxConnections, max_connections, MetricType::Gauge, ROUTER_MAX_CONN, "The max number of client connections allowed per route."},
    { RouterCurrentConnections, current_connections, MetricType::Gauge, ROUTER_CURR_CONN, "The current client connection count."},
    { RouterComLatency, com_latency, MetricType::Histogram, ROUTER_COM_LATENCY, "Latency of command round-trips."},
    { PoolIdleConnections, pool_idle_connections, MetricType::Gauge, POOL_IDLE_CONN, "Idle server connections held by the pool."},
    { PoolStashedConnections, pool_stashed_connections, MetricType::Gauge, POOL_STASHED_CONN, "Server connections stashed by client sessions."},
    { PoolReusedTotal, pool_reused_total, MetricType::Counter, POOL_REUSED_TOTAL, "Server connections handed out from the pool."},
    { PoolClosedTotal, pool_closed_total, MetricType::Counter, POOL_CLOSED_TOTAL, "Server connections closed by the pool."}
);
