//! Dynamic native plugin loader.
//!
//! Plugin artifacts are `.so`/`.dll` shared objects exporting a small set
//! of C-ABI symbols. Every hook symbol shares one calling convention —
//! a null-terminated UTF-8 JSON string in, a null-terminated UTF-8 JSON
//! string (or null) out — so a single `JsonHookFn` type covers all of
//! them and symbol resolution is just "does this name exist with this
//! type".

use std::ffi::{c_char, CStr, CString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libloading::Library;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PluginLoaderConfig;
use crate::error::{LoaderError, LoaderResult, PipelineError, PipelineResult};
use crate::pipeline::{
    HttpRequestContext, HttpResponseContext, LlmRequest, LlmStageOutcome, McpRequest,
    McpResponse, Plugin, PreLlmDecision, StreamChunk, Trace,
};
#[cfg(test)]
use crate::pipeline::LlmResponse;

type GetNameFn = unsafe extern "C" fn() -> *const c_char;
type CleanupFn = unsafe extern "C" fn() -> *mut c_char;
type InitFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
/// JSON request in, JSON response (or null) out. Covers every optional
/// hook symbol — `PreHook`, `PostHook`, `StreamChunkHook`, `PreLLMHook`,
/// `PostLLMHook`, `PreMCPHook`, `PostMCPHook`, `Inject`.
type JsonHookFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;

/// A loaded, symbol-verified plugin artifact. Implements [`Plugin`] by
/// marshalling each hook call across the C ABI as JSON.
pub struct PluginDescriptor {
    // Kept only to pin the artifact's code/data pages in memory; never
    // touched again after the raw function pointers below are copied out.
    _library: Option<Library>,
    name: String,
    cleanup_fn: CleanupFn,
    pre_hook: Option<JsonHookFn>,
    post_hook: Option<JsonHookFn>,
    stream_chunk_hook: Option<JsonHookFn>,
    pre_llm: Option<JsonHookFn>,
    post_llm: Option<JsonHookFn>,
    pre_mcp: Option<JsonHookFn>,
    post_mcp: Option<JsonHookFn>,
    inject: Option<JsonHookFn>,
}

// The raw fn pointers are `Copy` data and the plugin contract requires
// exported symbols to be safe to call from any thread; `_library` is
// never read again after construction.
unsafe impl Sync for PluginDescriptor {}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum WireLlmDecision {
    Continue { request: LlmRequest },
    ShortCircuit { outcome: LlmStageOutcome },
}

impl WireLlmDecision {
    fn into_decision(self) -> PreLlmDecision {
        match self {
            WireLlmDecision::Continue { request } => PreLlmDecision::Continue(request),
            WireLlmDecision::ShortCircuit { outcome } => PreLlmDecision::ShortCircuit(outcome),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTransportPost {
    request: HttpRequestContext,
    response: HttpResponseContext,
}

fn to_c_string(value: &impl Serialize) -> PipelineResult<CString> {
    let json = serde_json::to_string(value)
        .map_err(|e| PipelineError::Hook { plugin: "loader".to_string(), message: e.to_string() })?;
    CString::new(json)
        .map_err(|e| PipelineError::Hook { plugin: "loader".to_string(), message: e.to_string() })
}

/// Reads a raw C string returned by a plugin call. Returning ownership of
/// the pointer back to the plugin's allocator is out of scope here — the
/// plugin contract assumes long-lived, infrequent error strings.
unsafe fn read_c_string(ptr: *mut c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn hook_err(plugin: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::Hook { plugin: plugin.to_string(), message: message.into() }
}

impl PluginDescriptor {
    fn call(&self, f: JsonHookFn, payload: &impl Serialize) -> PipelineResult<Option<String>> {
        let input = to_c_string(payload)?;
        let raw = unsafe { f(input.as_ptr()) };
        Ok(unsafe { read_c_string(raw) })
    }
}

#[async_trait]
impl Plugin for PluginDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cleanup(&self) -> PipelineResult<()> {
        let raw = unsafe { (self.cleanup_fn)() };
        match unsafe { read_c_string(raw) } {
            None => Ok(()),
            Some(message) => Err(hook_err(&self.name, message)),
        }
    }

    async fn pre_hook(&self, req: &HttpRequestContext) -> PipelineResult<Option<HttpResponseContext>> {
        let Some(f) = self.pre_hook else { return Ok(None) };
        match self.call(f, req)? {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| hook_err(&self.name, e.to_string())),
        }
    }

    async fn post_hook(&self, req: &HttpRequestContext, resp: &HttpResponseContext) -> PipelineResult<()> {
        let Some(f) = self.post_hook else { return Ok(()) };
        let payload = WireTransportPost { request: req.clone(), response: resp.clone() };
        match self.call(f, &payload)? {
            None => Ok(()),
            Some(message) => Err(hook_err(&self.name, message)),
        }
    }

    async fn stream_chunk_hook(&self, chunk: StreamChunk) -> PipelineResult<Option<StreamChunk>> {
        let Some(f) = self.stream_chunk_hook else { return Ok(Some(chunk)) };
        match self.call(f, &chunk)? {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| hook_err(&self.name, e.to_string())),
        }
    }

    async fn pre_llm(&self, req: LlmRequest) -> PipelineResult<PreLlmDecision> {
        let Some(f) = self.pre_llm else { return Ok(PreLlmDecision::Continue(req)) };
        match self.call(f, &req)? {
            None => Ok(PreLlmDecision::Continue(req)),
            Some(json) => {
                let wire: WireLlmDecision =
                    serde_json::from_str(&json).map_err(|e| hook_err(&self.name, e.to_string()))?;
                Ok(wire.into_decision())
            }
        }
    }

    async fn post_llm(&self, outcome: LlmStageOutcome) -> PipelineResult<LlmStageOutcome> {
        let Some(f) = self.post_llm else { return Ok(outcome) };
        match self.call(f, &outcome)? {
            None => Ok(outcome),
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| hook_err(&self.name, e.to_string()))
            }
        }
    }

    async fn pre_mcp(&self, req: McpRequest) -> PipelineResult<McpRequest> {
        let Some(f) = self.pre_mcp else { return Ok(req) };
        match self.call(f, &req)? {
            None => Ok(req),
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| hook_err(&self.name, e.to_string()))
            }
        }
    }

    async fn post_mcp(&self, resp: McpResponse) -> PipelineResult<McpResponse> {
        let Some(f) = self.post_mcp else { return Ok(resp) };
        match self.call(f, &resp)? {
            None => Ok(resp),
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| hook_err(&self.name, e.to_string()))
            }
        }
    }

    async fn inject(&self, trace: &Trace) {
        let Some(f) = self.inject else { return };
        if let Ok(Some(message)) = self.call(f, trace) {
            warn!(plugin = %self.name, message, "observability plugin reported an error from Inject");
        }
    }
}

/// Downloads or locates a plugin artifact and resolves its symbols.
pub struct PluginLoader {
    http: reqwest::Client,
    config: PluginLoaderConfig,
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new(PluginLoaderConfig::default())
    }
}

impl PluginLoader {
    pub fn new(config: PluginLoaderConfig) -> Self {
        Self { http: reqwest::Client::new(), config }
    }

    /// Downloads `source` if it is an `http(s)` URL, decompressing per
    /// `Content-Encoding`; otherwise returns the path unchanged.
    pub async fn acquire_artifact(&self, source: &str) -> LoaderResult<PathBuf> {
        if !source.starts_with("http://") && !source.starts_with("https://") {
            return Ok(PathBuf::from(source));
        }

        debug!(source, "downloading plugin artifact");
        let response = self
            .http
            .get(source)
            .timeout(self.config.download_timeout())
            .send()
            .await
            .map_err(|e| LoaderError::Fetch(e.to_string()))?;

        if response.status().as_u16() != 200 {
            return Err(LoaderError::Fetch(format!(
                "artifact download returned status {}",
                response.status()
            )));
        }

        let encoding = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_lowercase);

        let bytes = response.bytes().await.map_err(|e| LoaderError::Fetch(e.to_string()))?;
        let decompressed = match encoding.as_deref() {
            Some("gzip") => decompress_gzip(&bytes)?,
            Some("deflate") => decompress_deflate(&bytes)?,
            _ => bytes.to_vec(),
        };

        let temp = tempfile::Builder::new()
            .prefix("bifrost-plugin-")
            .tempfile()
            .map_err(LoaderError::Io)?;
        let path = temp.path().to_path_buf();
        std::fs::write(&path, &decompressed).map_err(LoaderError::Io)?;
        // Keep the artifact on disk for the process lifetime; the loader
        // does not clean these up.
        let (_, path) = temp.keep().map_err(|e| LoaderError::Io(e.error))?;
        set_executable(&path)?;

        info!(path = %path.display(), "plugin artifact staged");
        Ok(path)
    }

    /// Loads and fully wires a plugin artifact, resolving required and
    /// optional hook symbols (with legacy aliasing).
    pub async fn load(&self, source: &str, config: Option<&[u8]>) -> LoaderResult<Arc<PluginDescriptor>> {
        let path = self.acquire_artifact(source).await?;
        let config = config.map(|c| c.to_vec());
        let descriptor =
            tokio::task::spawn_blocking(move || load_descriptor(&path, config.as_deref()))
                .await
                .map_err(|e| LoaderError::Fetch(format!("loader task panicked: {e}")))??;
        info!(plugin = %descriptor.name, "plugin loaded");
        Ok(Arc::new(descriptor))
    }

    /// Loads an artifact far enough to confirm it exports `GetName`, then
    /// drops it without wiring any hooks.
    pub async fn verify_base_plugin(&self, source: &str) -> LoaderResult<String> {
        let path = self.acquire_artifact(source).await?;
        tokio::task::spawn_blocking(move || {
            let library = unsafe { Library::new(&path) }.map_err(LoaderError::Open)?;
            let get_name: GetNameFn = *unsafe { library.get::<GetNameFn>(b"GetName\0") }
                .map_err(|_| LoaderError::MissingSymbol("GetName".to_string()))?;
            let _cleanup: CleanupFn = *unsafe { library.get::<CleanupFn>(b"Cleanup\0") }
                .map_err(|_| LoaderError::MissingSymbol("Cleanup".to_string()))?;
            let name = read_name(get_name)?;
            Ok(name)
        })
        .await
        .map_err(|e| LoaderError::Fetch(format!("loader task panicked: {e}")))?
    }
}

fn read_name(get_name: GetNameFn) -> LoaderResult<String> {
    let raw = unsafe { get_name() };
    if raw.is_null() {
        return Err(LoaderError::SymbolMismatch("GetName returned null".to_string()));
    }
    Ok(unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned())
}

/// Looks up `primary`, falling back to `legacy` if absent (the `PreHook`
/// → `PreLLMHook`, `PostHook` → `PostLLMHook` aliasing rule).
fn resolve_with_alias(library: &Library, primary: &[u8], legacy: Option<&[u8]>) -> Option<JsonHookFn> {
    if let Ok(sym) = unsafe { library.get::<JsonHookFn>(primary) } {
        return Some(*sym);
    }
    let legacy = legacy?;
    unsafe { library.get::<JsonHookFn>(legacy) }.ok().map(|s| *s)
}

fn load_descriptor(path: &Path, config: Option<&[u8]>) -> LoaderResult<PluginDescriptor> {
    let library = unsafe { Library::new(path) }.map_err(LoaderError::Open)?;

    let get_name: GetNameFn = *unsafe { library.get::<GetNameFn>(b"GetName\0") }
        .map_err(|_| LoaderError::MissingSymbol("GetName".to_string()))?;
    let cleanup_fn: CleanupFn = *unsafe { library.get::<CleanupFn>(b"Cleanup\0") }
        .map_err(|_| LoaderError::MissingSymbol("Cleanup".to_string()))?;
    let name = read_name(get_name)?;

    if let Ok(init) = unsafe { library.get::<InitFn>(b"Init\0") } {
        let init: InitFn = *init;
        let config_json = config.map(|c| String::from_utf8_lossy(c).into_owned()).unwrap_or_default();
        let config_cstr = CString::new(config_json)
            .map_err(|e| LoaderError::InitFailed(e.to_string()))?;
        let raw = unsafe { init(config_cstr.as_ptr()) };
        if let Some(message) = unsafe { read_c_string(raw) } {
            return Err(LoaderError::InitFailed(message));
        }
    }

    let pre_llm = resolve_with_alias(&library, b"PreLLMHook\0", Some(b"PreHook\0"));
    let post_llm = resolve_with_alias(&library, b"PostLLMHook\0", Some(b"PostHook\0"));
    let pre_hook = resolve_with_alias(&library, b"PreHook\0", None);
    let post_hook = resolve_with_alias(&library, b"PostHook\0", None);
    let stream_chunk_hook = resolve_with_alias(&library, b"StreamChunkHook\0", None);
    let pre_mcp = resolve_with_alias(&library, b"PreMCPHook\0", None);
    let post_mcp = resolve_with_alias(&library, b"PostMCPHook\0", None);
    let inject = resolve_with_alias(&library, b"Inject\0", None);

    Ok(PluginDescriptor {
        _library: Some(library),
        name,
        cleanup_fn,
        pre_hook,
        post_hook,
        stream_chunk_hook,
        pre_llm,
        post_llm,
        pre_mcp,
        post_mcp,
        inject,
    })
}

fn decompress_gzip(bytes: &[u8]) -> LoaderResult<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(LoaderError::Io)?;
    Ok(out)
}

fn decompress_deflate(bytes: &[u8]) -> LoaderResult<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(LoaderError::Io)?;
    Ok(out)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> LoaderResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(LoaderError::Io)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> LoaderResult<()> {
    Ok(())
}
