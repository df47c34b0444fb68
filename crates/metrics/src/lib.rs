//! Sequencer metrics and Prometheus exporter wiring.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global metrics recorder.
///
/// Call this once at startup before recording metrics.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
	let builder = PrometheusBuilder::new();
	let handle = builder.install_recorder()?;
	PROM_HANDLE
		.set(handle)
		.map_err(|_| "prometheus handle already initialized".to_string())?;
	Ok(())
}

/// Render all metrics in Prometheus text format.
pub fn render_metrics() -> String {
	PROM_HANDLE
		.get()
		.map(|h| h.render())
		.unwrap_or_else(|| "".to_string())
}

/// Record that a transaction was submitted into the mempool.
pub fn record_tx_submitted() {
	counter!("sequencer_tx_submitted").increment(1);
}

/// Update the mempool size gauge.
pub fn record_mempool_size(len: usize) {
	gauge!("sequencer_mempool_size").set(len as f64);
}

/// Record that a block was committed, along with its transaction count.
pub fn record_block_committed(tx_count: usize) {
	counter!("sequencer_blocks_committed").increment(1);
	counter!("sequencer_txs_committed").increment(tx_count as u64);
}

/// Record the duration of a storage backend operation, labeled by op name.
pub fn record_storage_op_duration_ms(op: &'static str, millis: f64) {
	gauge!("sequencer_storage_op_duration_ms", "op" => op).set(millis);
}

/// Update the current consensus round phase gauge (0..=4, per the Round
/// State Machine's phase numbering).
pub fn record_consensus_phase(phase: u8) {
	gauge!("sequencer_consensus_phase").set(phase as f64);
}

/// Record the wall-clock duration of one full consensus round (IDLE to
/// IDLE), successful or aborted.
pub fn record_consensus_round_duration_ms(millis: f64) {
	gauge!("sequencer_consensus_round_duration_ms").set(millis);
}

/// Update the count of signatures collected so far in the current round.
pub fn record_quorum_sigs_collected(count: usize) {
	gauge!("sequencer_quorum_sigs_collected").set(count as f64);
}

/// Record that a round was abandoned (signature tally below quorum, or
/// local hash lost the tally) rather than committed.
pub fn record_round_aborted() {
	counter!("sequencer_rounds_aborted").increment(1);
}
