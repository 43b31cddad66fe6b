//! 流式执行集成测试

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use capflow::capabilities::{register_builtins, Capability, CapabilityContext, CapabilityRegistry};
    use capflow::pattern::*;
    use futures_util::StreamExt;
    use serde_json::{json, Map, Value};
    use tokio::sync::Notify;

    fn object(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn kind(event: &PatternEvent) -> &'static str {
        match event {
            PatternEvent::PatternStart { .. } => "pattern_start",
            PatternEvent::StepStart { .. } => "step_start",
            PatternEvent::StepComplete { .. } => "step_complete",
            PatternEvent::StepError { .. } => "step_error",
            PatternEvent::TextChunk { .. } => "text_chunk",
            PatternEvent::PatternComplete { .. } => "pattern_complete",
            PatternEvent::FinalResult { .. } => "final_result",
            PatternEvent::ExecutionError { .. } => "execution_error",
        }
    }

    fn runner_with(patterns: Vec<PatternDefinition>) -> Arc<PatternRunner> {
        let mut registry = CapabilityRegistry::new();
        register_builtins(&mut registry);
        registry.register_fn("fail", |_| anyhow::bail!("missing benchmark"));
        let store = patterns.into_iter().fold(PatternStore::new(), |s, p| s.with(p));
        Arc::new(PatternRunner::new(Arc::new(registry), Arc::new(store)))
    }

    #[tokio::test]
    async fn test_events_in_step_order() {
        let runner = runner_with(vec![PatternDefinition::new(
            "two",
            vec![
                StepSpec::new("echo").params(json!({"text": "{name}"})).describe("greet"),
                StepSpec::new("echo").params(json!({"text": "again"})).save_as("second"),
            ],
            OutputSpec::Keys(vec!["text".into(), "second".into()]),
        )]);

        let events: Vec<PatternEvent> = runner.stream("two", object(json!({"name": "ann"}))).collect().await;
        let kinds: Vec<&str> = events.iter().map(kind).collect();
        assert_eq!(
            kinds,
            vec![
                "pattern_start",
                "step_start",
                "step_complete",
                "step_start",
                "step_complete",
                "pattern_complete",
                "final_result"
            ]
        );
        assert!(matches!(events[0], PatternEvent::PatternStart { total_steps: 2, .. }));
        match events.last() {
            Some(PatternEvent::FinalResult { result }) => {
                assert_eq!(result.data["text"], json!("ann"));
                assert_eq!(result.data["second"], json!({"text": "again"}));
            }
            other => panic!("Expected final result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_halting_step_ends_with_execution_error() {
        let runner = runner_with(vec![PatternDefinition::new(
            "halt",
            vec![StepSpec::new("fail").stop_on_error(), StepSpec::new("echo")],
            OutputSpec::default(),
        )]);

        let events = runner.stream("halt", Map::new()).collect_events().await;
        let kinds: Vec<&str> = events.iter().map(kind).collect();
        assert_eq!(kinds, vec!["pattern_start", "step_start", "step_error", "execution_error"]);
        assert!(matches!(events[2], PatternEvent::StepError { halted: true, .. }));
    }

    #[tokio::test]
    async fn test_unknown_pattern_yields_execution_error_only() {
        let runner = runner_with(vec![]);
        let events = runner.stream("ghost", Map::new()).collect_events().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PatternEvent::ExecutionError { error } if error.contains("ghost")));
    }

    #[tokio::test]
    async fn test_token_mode_streams_generative_step_only() {
        let runner = runner_with(vec![PatternDefinition::new(
            "narrative",
            vec![
                StepSpec::new("echo").params(json!({"text": "portfolio beat benchmark by 2.1%"})),
                StepSpec::new("text.generate")
                    .params(json!({"prompt": "{text}"}))
                    .save_as("summary"),
            ],
            OutputSpec::Keys(vec!["summary".into()]),
        )]);

        let events = runner
            .stream_tokens("narrative", Map::new(), "text.generate")
            .collect_events()
            .await;

        assert!(!events.iter().any(|e| matches!(e, PatternEvent::StepStart { .. })));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                PatternEvent::TextChunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Summary: portfolio beat benchmark by 2.1%");
        assert!(events.iter().filter(|e| matches!(e, PatternEvent::TextChunk { .. })).count() > 1);

        match events.last() {
            Some(PatternEvent::FinalResult { result }) => {
                assert_eq!(result.data["summary"], json!({"text": text}));
            }
            other => panic!("Expected final result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_events_and_keeps_applied_state() {
        let runner = runner_with(vec![PatternDefinition::new(
            "long",
            vec![
                StepSpec::new("echo").params(json!({"text": "one"})).save_as("s0"),
                StepSpec::new("echo").params(json!({"text": "two"})).save_as("s1"),
                StepSpec::new("echo").params(json!({"text": "three"})).save_as("s2"),
            ],
            OutputSpec::default(),
        )]);

        let mut stream = runner.stream("long", Map::new());
        assert!(matches!(stream.next_event().await, Some(PatternEvent::PatternStart { .. })));
        assert!(matches!(stream.next_event().await, Some(PatternEvent::StepStart { index: 0, .. })));
        stream.cancel();

        let result = stream.finish().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Execution cancelled"));
        assert!(result.trace.len() < 3);
        for outcome in &result.trace {
            assert!(result.state.contains(&format!("s{}", outcome.index)));
        }
    }

    /// 等待外部放行后才返回的能力
    struct HeldCapability {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Capability for HeldCapability {
        async fn execute(&self, _params: Value, _ctx: &CapabilityContext) -> anyhow::Result<Map<String, Value>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(object(json!({"held": true})))
        }
    }

    #[tokio::test]
    async fn test_cancel_in_token_mode_stops_silent_steps() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let later = Arc::new(AtomicUsize::new(0));

        let mut registry = CapabilityRegistry::new();
        register_builtins(&mut registry);
        registry.register(
            "hold",
            HeldCapability {
                started: Arc::clone(&started),
                release: Arc::clone(&release),
            },
        );
        let counter = Arc::clone(&later);
        registry.register_fn("prices.load", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Map::new())
        });

        let pattern = PatternDefinition::new(
            "narrative",
            vec![
                StepSpec::new("hold"),
                StepSpec::new("prices.load"),
                StepSpec::new("prices.load"),
                StepSpec::new("text.generate").params(json!({"prompt": "done"})),
            ],
            OutputSpec::default(),
        );
        let runner = Arc::new(PatternRunner::new(
            Arc::new(registry),
            Arc::new(PatternStore::new().with(pattern)),
        ));

        let mut stream = runner.stream_tokens("narrative", Map::new(), "text.generate");
        assert!(matches!(stream.next_event().await, Some(PatternEvent::PatternStart { .. })));
        started.notified().await;
        stream.cancel();
        release.notify_one();

        let result = stream.finish().await.unwrap();
        assert!(!result.success);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(result.trace.len(), 1);
        assert!(result.state.contains("held"));
    }
}
