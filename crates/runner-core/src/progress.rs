//! Progress reporting hook, used by `load_model` to surface shard-load and
//! weight-materialization percentage without the pipeline depending on any
//! particular UI or logging sink.

pub trait ProgressSink: Send + Sync {
    /// `percent` is fractional, in `[0.0, 1.0]` — not a `0..100` scale.
    fn on_stage(&self, stage: &str, percent: f32, message: &str);
}

pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_stage(&self, _stage: &str, _percent: f32, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<(String, f32)>>);

    impl ProgressSink for RecordingSink {
        fn on_stage(&self, stage: &str, percent: f32, _message: &str) {
            self.0.lock().unwrap().push((stage.to_string(), percent));
        }
    }

    #[test]
    fn noop_sink_accepts_any_call() {
        let sink = NoopProgressSink;
        sink.on_stage("loading_shards", 0.5, "halfway");
    }

    #[test]
    fn recording_sink_captures_calls() {
        let sink = RecordingSink(Mutex::new(Vec::new()));
        sink.on_stage("loading_shards", 0.0, "start");
        sink.on_stage("loading_shards", 1.0, "done");
        let calls = sink.0.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, 1.0);
    }
}
