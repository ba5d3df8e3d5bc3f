use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
};
use std::sync::Arc;

/// Transaction manager metrics, all labelled by chain.
pub struct TxmMetrics {
    pub transaction_queued_to_broadcast_duration: HistogramVec,
    pub transaction_queued_to_confirmed_duration: HistogramVec,
    pub reorg_demotions: IntCounterVec,
    pub resent_transactions: IntCounterVec,
    pub reaped_transactions: IntCounterVec,
    pub fatal_transactions: IntCounterVec,
}

impl TxmMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let transaction_queued_to_broadcast_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "txm_transaction_queued_to_broadcast_duration_seconds",
                "Time from when a transaction is created to its first accepted broadcast"
            )
            .buckets(vec![
                0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0
            ]),
            &["chain_id"],
            registry
        )?;

        let transaction_queued_to_confirmed_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "txm_transaction_queued_to_confirmed_duration_seconds",
                "Time from when a transaction is created to when it's confirmed on-chain"
            )
            .buckets(vec![
                0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0
            ]),
            &["chain_id"],
            registry
        )?;

        let reorg_demotions = register_int_counter_vec_with_registry!(
            Opts::new(
                "txm_reorg_demotions_total",
                "Confirmed transactions moved back to unconfirmed after a reorg"
            ),
            &["chain_id"],
            registry
        )?;

        let resent_transactions = register_int_counter_vec_with_registry!(
            Opts::new(
                "txm_resent_transactions_total",
                "Stale unconfirmed transactions rebroadcast by the resender"
            ),
            &["chain_id"],
            registry
        )?;

        let reaped_transactions = register_int_counter_vec_with_registry!(
            Opts::new(
                "txm_reaped_transactions_total",
                "Terminal transactions deleted by the reaper"
            ),
            &["chain_id"],
            registry
        )?;

        let fatal_transactions = register_int_counter_vec_with_registry!(
            Opts::new(
                "txm_fatal_transactions_total",
                "Transactions that ended in fatal_error"
            ),
            &["chain_id"],
            registry
        )?;

        Ok(TxmMetrics {
            transaction_queued_to_broadcast_duration,
            transaction_queued_to_confirmed_duration,
            reorg_demotions,
            resent_transactions,
            reaped_transactions,
            fatal_transactions,
        })
    }
}

lazy_static! {
    /// Fallback registry when the binary does not provide one.
    static ref DEFAULT_TXM_METRICS_REGISTRY: Registry = Registry::new();

    static ref DEFAULT_TXM_METRICS: Option<Arc<TxmMetrics>> =
        match TxmMetrics::new(&DEFAULT_TXM_METRICS_REGISTRY) {
            Ok(metrics) => Some(Arc::new(metrics)),
            Err(e) => {
                tracing::error!(error = ?e, "Failed to register default txm metrics");
                None
            }
        };

    static ref TXM_METRICS_INSTANCE: std::sync::RwLock<Option<Arc<TxmMetrics>>> =
        std::sync::RwLock::new(None);
}

/// Install metrics registered on the binary's own registry.
/// Call once at startup, before any worker runs.
pub fn initialize_metrics(metrics: TxmMetrics) {
    match TXM_METRICS_INSTANCE.write() {
        Ok(mut instance) => *instance = Some(Arc::new(metrics)),
        Err(poisoned) => *poisoned.into_inner() = Some(Arc::new(metrics)),
    }
}

fn get_metrics() -> Option<Arc<TxmMetrics>> {
    let custom = match TXM_METRICS_INSTANCE.read() {
        Ok(instance) => instance.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    custom.or_else(|| DEFAULT_TXM_METRICS.clone())
}

/// Export metrics in Prometheus format from the default registry.
pub fn export_default_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = DEFAULT_TXM_METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_transaction_queued_to_broadcast(chain_id: u64, duration_seconds: f64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .transaction_queued_to_broadcast_duration
            .with_label_values(&[&chain_id.to_string()])
            .observe(duration_seconds);
    }
}

pub fn record_transaction_queued_to_confirmed(chain_id: u64, duration_seconds: f64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .transaction_queued_to_confirmed_duration
            .with_label_values(&[&chain_id.to_string()])
            .observe(duration_seconds);
    }
}

pub fn record_reorg_demotion(chain_id: u64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .reorg_demotions
            .with_label_values(&[&chain_id.to_string()])
            .inc();
    }
}

pub fn record_resent(chain_id: u64, count: u64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .resent_transactions
            .with_label_values(&[&chain_id.to_string()])
            .inc_by(count);
    }
}

pub fn record_reaped(chain_id: u64, count: u64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .reaped_transactions
            .with_label_values(&[&chain_id.to_string()])
            .inc_by(count);
    }
}

pub fn record_fatal(chain_id: u64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .fatal_transactions
            .with_label_values(&[&chain_id.to_string()])
            .inc();
    }
}

/// Duration in seconds between two unix millisecond timestamps, never negative.
pub fn calculate_duration_seconds(start_timestamp_ms: u64, end_timestamp_ms: u64) -> f64 {
    (end_timestamp_ms.saturating_sub(start_timestamp_ms)) as f64 / 1000.0
}
