use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Process-wide usage metrics for ingredient and backend activity.
#[derive(Clone, Debug)]
pub struct UsageRegistry {
    inner: Arc<UsageInner>,
}

#[derive(Debug)]
struct UsageInner {
    registry: Registry,
    ingredient_calls: CounterVec,
    values_routed: CounterVec,
    prompt_tokens: CounterVec,
    completion_tokens: CounterVec,
    backend_statements: CounterVec,
    blend_seconds: HistogramVec,
}

impl UsageInner {
    fn new() -> Self {
        let registry = Registry::new();
        let ingredient_calls = CounterVec::new(
            Opts::new("simmer_ingredient_calls_total", "Ingredient invocations"),
            &["ingredient", "kind"],
        )
        .expect("metric opts");
        let values_routed = CounterVec::new(
            Opts::new(
                "simmer_values_routed_total",
                "Distinct values forwarded to ingredient invocations",
            ),
            &["ingredient"],
        )
        .expect("metric opts");
        let prompt_tokens = CounterVec::new(
            Opts::new("simmer_prompt_tokens_total", "Prompt tokens reported by ingredients"),
            &["ingredient"],
        )
        .expect("metric opts");
        let completion_tokens = CounterVec::new(
            Opts::new(
                "simmer_completion_tokens_total",
                "Completion tokens reported by ingredients",
            ),
            &["ingredient"],
        )
        .expect("metric opts");
        let backend_statements = CounterVec::new(
            Opts::new("simmer_backend_statements_total", "Statements sent to the backend"),
            &["kind"],
        )
        .expect("metric opts");
        let blend_seconds = HistogramVec::new(
            HistogramOpts::new("simmer_blend_seconds", "Wall time of top-level blend calls"),
            &["outcome"],
        )
        .expect("metric opts");

        for c in [
            &ingredient_calls,
            &values_routed,
            &prompt_tokens,
            &completion_tokens,
            &backend_statements,
        ] {
            registry.register(Box::new(c.clone())).expect("metric registration");
        }
        registry
            .register(Box::new(blend_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            ingredient_calls,
            values_routed,
            prompt_tokens,
            completion_tokens,
            backend_statements,
            blend_seconds,
        }
    }
}

impl Default for UsageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(UsageInner::new()),
        }
    }

    pub fn record_ingredient_call(&self, ingredient: &str, kind: &str, values_routed: u64) {
        self.inner
            .ingredient_calls
            .with_label_values(&[ingredient, kind])
            .inc();
        self.inner
            .values_routed
            .with_label_values(&[ingredient])
            .inc_by(values_routed as f64);
    }

    pub fn record_tokens(&self, ingredient: &str, prompt: u64, completion: u64) {
        self.inner
            .prompt_tokens
            .with_label_values(&[ingredient])
            .inc_by(prompt as f64);
        self.inner
            .completion_tokens
            .with_label_values(&[ingredient])
            .inc_by(completion as f64);
    }

    pub fn record_backend_statement(&self, kind: &str) {
        self.inner
            .backend_statements
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_blend(&self, outcome: &str, secs: f64) {
        self.inner
            .blend_seconds
            .with_label_values(&[outcome])
            .observe(secs.max(0.0));
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn export_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Per-execution usage counters rolled up into the result envelope.
///
/// Shared by the outermost call and all nested recursive calls of one
/// session, so nested work is attributed to the triggering statement.
#[derive(Debug, Default)]
pub struct UsageCounters {
    values_passed: AtomicU64,
    generation_calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_values_passed(&self, n: u64) {
        self.values_passed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_generation_call(&self) {
        self.generation_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn values_passed(&self) -> u64 {
        self.values_passed.load(Ordering::Relaxed)
    }

    pub fn generation_calls(&self) -> u64 {
        self.generation_calls.load(Ordering::Relaxed)
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens.load(Ordering::Relaxed)
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = UsageCounters::new();
        c.add_values_passed(2);
        c.add_values_passed(3);
        c.add_generation_call();
        c.add_tokens(10, 4);
        assert_eq!(c.values_passed(), 5);
        assert_eq!(c.generation_calls(), 1);
        assert_eq!(c.prompt_tokens(), 10);
        assert_eq!(c.completion_tokens(), 4);
    }

    #[test]
    fn registry_exports_text() {
        let m = UsageRegistry::new();
        m.record_ingredient_call("pick_city", "qa", 2);
        let text = m.export_text();
        assert!(text.contains("simmer_ingredient_calls_total"));
    }
}
