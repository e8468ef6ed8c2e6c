//! Plugin pipeline: a fixed set of hook stages run over registered
//! plugins with staged short-circuiting, error isolation, and symmetric
//! pre/post ordering.
//!
//! A plugin implements [`Plugin`] and overrides only the hooks it cares
//! about — every hook has an identity-behavior default, so a plugin that
//! only touches LLM requests never has to think about HTTP transport or
//! MCP at all. Each hook invocation runs in its own task so a panicking
//! plugin can't take down the caller's task; the panic is recovered and
//! turned into a [`PipelineError::Panic`].

mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use types::{
    ExecutionOutcome, HttpRequestContext, HttpResponseContext, LlmRequest, LlmResponse,
    LlmStageOutcome, McpRequest, McpResponse, PreLlmDecision, StreamChunk, Trace,
};

use crate::error::{PipelineError, PipelineResult};

/// A plugin's hook surface. Unimplemented hooks behave as the identity:
/// `pre_hook`/`pre_mcp` pass the input through unmodified, `post_llm`
/// returns its input outcome unchanged, `stream_chunk_hook` passes the
/// chunk through, `inject` is a no-op.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn cleanup(&self) -> PipelineResult<()> {
        Ok(())
    }

    async fn pre_hook(&self, _req: &HttpRequestContext) -> PipelineResult<Option<HttpResponseContext>> {
        Ok(None)
    }

    async fn post_hook(&self, _req: &HttpRequestContext, _resp: &HttpResponseContext) -> PipelineResult<()> {
        Ok(())
    }

    async fn stream_chunk_hook(&self, chunk: StreamChunk) -> PipelineResult<Option<StreamChunk>> {
        Ok(Some(chunk))
    }

    async fn pre_llm(&self, req: LlmRequest) -> PipelineResult<PreLlmDecision> {
        Ok(PreLlmDecision::Continue(req))
    }

    async fn post_llm(&self, outcome: LlmStageOutcome) -> PipelineResult<LlmStageOutcome> {
        Ok(outcome)
    }

    async fn pre_mcp(&self, req: McpRequest) -> PipelineResult<McpRequest> {
        Ok(req)
    }

    async fn post_mcp(&self, resp: McpResponse) -> PipelineResult<McpResponse> {
        Ok(resp)
    }

    async fn inject(&self, _trace: &Trace) {}
}

/// Outcome of the HTTP-transport pre-hook stage.
enum TransportPreOutcome {
    Continue,
    ShortCircuit(HttpResponseContext),
    Error(PipelineError),
}

/// Outcome of the LLM pre-hook stage.
enum LlmPreOutcome {
    Continue(LlmRequest),
    ShortCircuit(LlmStageOutcome),
    Error(PipelineError),
}

/// Registers plugins in a fixed order and sequences them through the
/// transport/LLM/MCP/streaming hook stages.
#[derive(Default)]
pub struct Pipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Registers a plugin. Pre-hooks run in registration order; post-hooks
    /// run in the reverse.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    async fn run_transport_pre(&self, req: &HttpRequestContext) -> (usize, TransportPreOutcome) {
        for (index, plugin) in self.plugins.iter().enumerate() {
            match invoke_pre_hook(plugin.clone(), req.clone()).await {
                Ok(Some(resp)) => return (index + 1, TransportPreOutcome::ShortCircuit(resp)),
                Ok(None) => continue,
                Err(err) => return (index + 1, TransportPreOutcome::Error(err)),
            }
        }
        (self.plugins.len(), TransportPreOutcome::Continue)
    }

    async fn run_transport_post(
        &self,
        executed_count: usize,
        req: &HttpRequestContext,
        resp: &HttpResponseContext,
    ) {
        for plugin in self.plugins[..executed_count].iter().rev() {
            if let Err(err) = invoke_post_hook(plugin.clone(), req.clone(), resp.clone()).await {
                tracing::warn!(plugin = plugin.name(), error = %err, "transport post-hook failed");
            }
        }
    }

    async fn run_llm_pre(&self, initial: LlmRequest) -> (usize, LlmPreOutcome) {
        let mut req = initial;
        for (index, plugin) in self.plugins.iter().enumerate() {
            match invoke_pre_llm(plugin.clone(), req.clone()).await {
                Ok(PreLlmDecision::Continue(updated)) => req = updated,
                Ok(PreLlmDecision::ShortCircuit(outcome)) => {
                    return (index + 1, LlmPreOutcome::ShortCircuit(outcome))
                }
                Err(err) => return (index + 1, LlmPreOutcome::Error(err)),
            }
        }
        (self.plugins.len(), LlmPreOutcome::Continue(req))
    }

    /// Runs post-LLM hooks in reverse order over the plugins whose
    /// pre-hook actually executed (property: post order is the reverse of
    /// pre order for any prefix that ran).
    async fn run_llm_post(&self, executed_count: usize, initial: LlmStageOutcome) -> LlmStageOutcome {
        let mut outcome = initial;
        for plugin in self.plugins[..executed_count].iter().rev() {
            match invoke_post_llm(plugin.clone(), outcome.clone()).await {
                Ok(updated) => outcome = updated,
                Err(err) => outcome = LlmStageOutcome::err(err.to_string()),
            }
        }
        outcome
    }

    /// Threads a single chunk through every plugin's stream hook in
    /// registration order; any plugin may transform or drop it.
    pub async fn run_stream_chunk(&self, initial: StreamChunk) -> PipelineResult<Option<StreamChunk>> {
        let mut chunk = initial;
        for plugin in &self.plugins {
            match invoke_stream_chunk_hook(plugin.clone(), chunk).await? {
                Some(updated) => chunk = updated,
                None => return Ok(None),
            }
        }
        Ok(Some(chunk))
    }

    pub async fn run_mcp_pre(&self, initial: McpRequest) -> PipelineResult<McpRequest> {
        let mut req = initial;
        for plugin in &self.plugins {
            req = invoke_pre_mcp(plugin.clone(), req).await?;
        }
        Ok(req)
    }

    /// Reverse order, for consistency with the LLM/transport stages; the
    /// contract doesn't call this out explicitly but nothing implies MCP
    /// post-hooks should behave asymmetrically from the rest.
    pub async fn run_mcp_post(&self, initial: McpResponse) -> PipelineResult<McpResponse> {
        let mut resp = initial;
        for plugin in self.plugins.iter().rev() {
            resp = invoke_post_mcp(plugin.clone(), resp).await?;
        }
        Ok(resp)
    }

    pub async fn run_observability_inject(&self, trace: &Trace) {
        for plugin in &self.plugins {
            invoke_inject(plugin.clone(), trace.clone()).await;
        }
    }

    /// Drives the full per-request state machine: transport-pre ->
    /// (short-circuit | llm-pre) -> (short-circuit | provider) ->
    /// llm-post -> transport-post. `provider_call` is invoked only when
    /// nothing short-circuited.
    pub async fn execute<F, Fut>(
        &self,
        transport_req: HttpRequestContext,
        llm_req: LlmRequest,
        provider_call: F,
    ) -> ExecutionOutcome
    where
        F: FnOnce(LlmRequest) -> Fut,
        Fut: std::future::Future<Output = LlmStageOutcome>,
    {
        let (transport_count, transport_pre) = self.run_transport_pre(&transport_req).await;

        match transport_pre {
            TransportPreOutcome::ShortCircuit(resp) => {
                self.run_transport_post(transport_count, &transport_req, &resp).await;
                return ExecutionOutcome {
                    response: None,
                    error: None,
                    transport_response: Some(resp),
                    short_circuited_by: self.plugins.get(transport_count - 1).map(|p| p.name().to_string()),
                };
            }
            TransportPreOutcome::Error(err) => {
                let synthetic = HttpResponseContext { status: 500, ..Default::default() };
                self.run_transport_post(transport_count, &transport_req, &synthetic).await;
                return ExecutionOutcome {
                    response: None,
                    error: Some(err.to_string()),
                    transport_response: Some(synthetic),
                    short_circuited_by: None,
                };
            }
            TransportPreOutcome::Continue => {}
        }

        let (llm_count, llm_pre) = self.run_llm_pre(llm_req).await;

        let short_circuited_by = match &llm_pre {
            LlmPreOutcome::ShortCircuit(_) => {
                self.plugins.get(llm_count - 1).map(|p| p.name().to_string())
            }
            _ => None,
        };

        let stage_outcome = match llm_pre {
            LlmPreOutcome::Continue(req) => provider_call(req).await,
            LlmPreOutcome::ShortCircuit(outcome) => outcome,
            LlmPreOutcome::Error(err) => LlmStageOutcome::err(err.to_string()),
        };

        let post_outcome = self.run_llm_post(llm_count, stage_outcome).await;

        let transport_resp = HttpResponseContext {
            status: if post_outcome.error.is_some() { 500 } else { 200 },
            headers: HashMap::new(),
            body: post_outcome
                .response
                .as_ref()
                .map(|r| r.payload.clone())
                .unwrap_or(Value::Null),
        };
        self.run_transport_post(transport_count, &transport_req, &transport_resp).await;

        ExecutionOutcome {
            response: post_outcome.response,
            error: post_outcome.error,
            transport_response: Some(transport_resp),
            short_circuited_by,
        }
    }
}

/// Runs `fut` on its own task so a plugin panic can't poison the caller's
/// task; translates a panic or cancellation into a [`PipelineError`].
async fn spawn_isolated<Fut, T>(plugin_name: String, fut: Fut) -> PipelineResult<T>
where
    Fut: std::future::Future<Output = PipelineResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                match join_err.into_panic().downcast::<String>() {
                    Ok(msg) => *msg,
                    Err(payload) => match payload.downcast::<&str>() {
                        Ok(msg) => msg.to_string(),
                        Err(_) => "plugin panicked".to_string(),
                    },
                }
            } else {
                "plugin task was cancelled".to_string()
            };
            Err(PipelineError::Panic { plugin: plugin_name, message })
        }
    }
}

async fn invoke_pre_hook(
    plugin: Arc<dyn Plugin>,
    req: HttpRequestContext,
) -> PipelineResult<Option<HttpResponseContext>> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.pre_hook(&req).await }).await
}

async fn invoke_post_hook(
    plugin: Arc<dyn Plugin>,
    req: HttpRequestContext,
    resp: HttpResponseContext,
) -> PipelineResult<()> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.post_hook(&req, &resp).await }).await
}

async fn invoke_stream_chunk_hook(
    plugin: Arc<dyn Plugin>,
    chunk: StreamChunk,
) -> PipelineResult<Option<StreamChunk>> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.stream_chunk_hook(chunk).await }).await
}

async fn invoke_pre_llm(plugin: Arc<dyn Plugin>, req: LlmRequest) -> PipelineResult<PreLlmDecision> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.pre_llm(req).await }).await
}

async fn invoke_post_llm(
    plugin: Arc<dyn Plugin>,
    outcome: LlmStageOutcome,
) -> PipelineResult<LlmStageOutcome> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.post_llm(outcome).await }).await
}

async fn invoke_pre_mcp(plugin: Arc<dyn Plugin>, req: McpRequest) -> PipelineResult<McpRequest> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.pre_mcp(req).await }).await
}

async fn invoke_post_mcp(plugin: Arc<dyn Plugin>, resp: McpResponse) -> PipelineResult<McpResponse> {
    let name = plugin.name().to_string();
    spawn_isolated(name, async move { plugin.post_mcp(resp).await }).await
}

async fn invoke_inject(plugin: Arc<dyn Plugin>, trace: Trace) {
    let name = plugin.name().to_string();
    let result: PipelineResult<()> = spawn_isolated(name.clone(), async move {
        plugin.inject(&trace).await;
        Ok(())
    })
    .await;
    if let Err(err) = result {
        tracing::warn!(plugin = %name, error = %err, "observability inject failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingPlugin {
        name: &'static str,
        order: Arc<StdMutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        async fn pre_llm(&self, req: LlmRequest) -> PipelineResult<PreLlmDecision> {
            self.order.lock().unwrap().push(format!("{}:pre", self.name));
            if self.short_circuit {
                Ok(PreLlmDecision::ShortCircuit(LlmStageOutcome::ok(LlmResponse {
                    payload: serde_json::json!({ "short_circuited_by": self.name }),
                })))
            } else {
                Ok(PreLlmDecision::Continue(req))
            }
        }

        async fn post_llm(&self, outcome: LlmStageOutcome) -> PipelineResult<LlmStageOutcome> {
            self.order.lock().unwrap().push(format!("{}:post", self.name));
            Ok(outcome)
        }
    }

    fn plugin(name: &'static str, order: &Arc<StdMutex<Vec<String>>>, short_circuit: bool) -> Arc<dyn Plugin> {
        Arc::new(RecordingPlugin { name, order: order.clone(), short_circuit })
    }

    #[tokio::test]
    async fn sc6_short_circuit_skips_provider_and_unwinds_in_reverse() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.register(plugin("A", &order, false));
        pipeline.register(plugin("B", &order, true));
        pipeline.register(plugin("C", &order, false));

        let provider_called = Arc::new(AtomicUsize::new(0));
        let provider_called_clone = provider_called.clone();

        let outcome = pipeline
            .execute(
                HttpRequestContext::default(),
                LlmRequest::default(),
                move |_req| async move {
                    provider_called_clone.fetch_add(1, Ordering::SeqCst);
                    LlmStageOutcome::ok(LlmResponse::default())
                },
            )
            .await;

        assert_eq!(provider_called.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.short_circuited_by.as_deref(), Some("B"));

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec!["A:pre", "B:pre", "B:post", "A:post"]);
    }

    #[tokio::test]
    async fn invariant_9_short_circuit_skips_later_pre_hooks() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.register(plugin("A", &order, true));
        pipeline.register(plugin("B", &order, false));

        pipeline
            .execute(HttpRequestContext::default(), LlmRequest::default(), |_req| async {
                panic!("provider must not be called");
            })
            .await;

        let recorded = order.lock().unwrap().clone();
        assert!(!recorded.contains(&"B:pre".to_string()));
    }

    struct PanickingPlugin;

    #[async_trait]
    impl Plugin for PanickingPlugin {
        fn name(&self) -> &str {
            "panicker"
        }

        async fn pre_llm(&self, _req: LlmRequest) -> PipelineResult<PreLlmDecision> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panic_inside_a_hook_is_recovered_as_pipeline_error() {
        let mut pipeline = Pipeline::new();
        pipeline.register(Arc::new(PanickingPlugin));

        let outcome = pipeline
            .execute(HttpRequestContext::default(), LlmRequest::default(), |req| async move {
                LlmStageOutcome::ok(LlmResponse { payload: req.payload })
            })
            .await;

        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn invariant_10_unimplemented_hooks_are_identity() {
        struct Bare;
        #[async_trait]
        impl Plugin for Bare {
            fn name(&self) -> &str {
                "bare"
            }
        }

        let mut pipeline = Pipeline::new();
        pipeline.register(Arc::new(Bare));

        let chunk = StreamChunk { sequence: 1, data: serde_json::json!("x"), is_final: false };
        let result = pipeline.run_stream_chunk(chunk.clone()).await.unwrap();
        assert_eq!(result.unwrap().data, chunk.data);

        let mcp_req = McpRequest { tool: "t".to_string(), arguments: serde_json::json!({}) };
        let passed_through = pipeline.run_mcp_pre(mcp_req.clone()).await.unwrap();
        assert_eq!(passed_through.tool, mcp_req.tool);
    }

    #[tokio::test]
    async fn transport_pre_short_circuit_skips_inner_pipeline() {
        struct RespondingPlugin;
        #[async_trait]
        impl Plugin for RespondingPlugin {
            fn name(&self) -> &str {
                "responder"
            }
            async fn pre_hook(&self, _req: &HttpRequestContext) -> PipelineResult<Option<HttpResponseContext>> {
                Ok(Some(HttpResponseContext { status: 204, ..Default::default() }))
            }
        }

        let mut pipeline = Pipeline::new();
        pipeline.register(Arc::new(RespondingPlugin));

        let outcome = pipeline
            .execute(HttpRequestContext::default(), LlmRequest::default(), |_req| async {
                panic!("provider must not run behind a transport short-circuit");
            })
            .await;

        assert_eq!(outcome.transport_response.unwrap().status, 204);
    }
}
