//! Observability utilities: GPU/system metrics plus pipeline-level gauges
//! the core crate reports into (KV layout, decode ring reuse, GPU phase
//! timings).

use once_cell::sync::Lazy;
use prometheus::{Gauge, Histogram, IntCounter, IntGauge};

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("runner_gpu_utilization", "GPU utilization percent").unwrap());
static GPU_MEM_USED: Lazy<IntGauge> = Lazy::new(|| prometheus::register_int_gauge!("runner_gpu_memory_bytes", "GPU memory used (bytes)").unwrap());
static GPU_TEMP: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("runner_gpu_temperature_celsius", "GPU temperature in C").unwrap());

static KV_CACHE_LAYOUT: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("runner_kv_cache_layout", "Active KV cache layout (0=contiguous, 1=sliding_window, 2=paged, 3=bdpa)").unwrap()
});
static DECODE_RING_REUSES: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("runner_decode_ring_reuses_total", "Decode ring slots reused beyond initial allocation").unwrap()
});
static GPU_TIME_PREFILL_MS: Lazy<Histogram> = Lazy::new(|| {
    prometheus::register_histogram!("runner_gpu_time_prefill_ms", "Prefill submit-to-readback wall time in milliseconds").unwrap()
});
static GPU_TIME_DECODE_MS: Lazy<Histogram> = Lazy::new(|| {
    prometheus::register_histogram!("runner_gpu_time_decode_ms", "Single decode step submit-to-readback wall time in milliseconds").unwrap()
});

pub fn init() {
    // Touch statics to ensure registration and avoid dead_code warnings when NVML is disabled.
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
    let _ = &*KV_CACHE_LAYOUT;
    let _ = &*DECODE_RING_REUSES;
    let _ = &*GPU_TIME_PREFILL_MS;
    let _ = &*GPU_TIME_DECODE_MS;
}

/// Encodes the active KV layout as a small integer; matches
/// `runner_common::config::KvLayoutKind`'s declaration order.
pub fn set_kv_cache_layout(layout_code: i64) {
    KV_CACHE_LAYOUT.set(layout_code);
}

pub fn record_decode_ring_reuses(count: u64) {
    DECODE_RING_REUSES.inc_by(count);
}

pub fn observe_prefill_ms(ms: f64) {
    GPU_TIME_PREFILL_MS.observe(ms);
}

pub fn observe_decode_ms(ms: f64) {
    GPU_TIME_DECODE_MS.observe(ms);
}

pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::NVML::init() { Ok(n) => n, Err(_) => return };
        let device = match nvml.device_by_index(0) { Ok(d) => d, Err(_) => return };
        loop {
            if let Ok(util) = device.utilization_rates() { GPU_UTIL.set(util.gpu as f64); }
            if let Ok(mem) = device.memory_info() { GPU_MEM_USED.set(mem.used as i64); }
            if let Ok(temp) = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu) { GPU_TEMP.set(temp as f64); }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}

