use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tokio::runtime::Runtime as IoRuntime;

use crate::config::RuntimeConfig;
use crate::error::VuError;
use crate::stats::Metric;

pub mod batch;
pub mod executor;
pub mod http_client;
pub mod vu;

pub use vu::Vu;

/// Where `$test.env()` reads values from.
pub trait EnvSource: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// The host process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Holds one script and produces VUs for it.
///
/// All VUs of a runner share a multi-threaded Tokio runtime for their network
/// I/O; each VU still has its own JS context, HTTP client and cookie jar.
pub struct Runner {
    filename: String,
    source: String,
    config: RuntimeConfig,
    sink: Option<Sender<Metric>>,
    env: Arc<dyn EnvSource>,
    io: Arc<IoRuntime>,
    span: tracing::Span,
}

impl Runner {
    /// Create a runner for `source`. The script is only compiled when a VU is
    /// created, so syntax errors surface from [`Runner::new_vu`].
    pub fn new(filename: impl Into<String>, source: impl Into<String>) -> Result<Self, VuError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let io = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("volley-io")
            .build()
            .map_err(|e| VuError::Runtime(format!("failed to start I/O runtime: {}", e)))?;

        let filename = filename.into();
        let span = tracing::info_span!("runner", script = %filename);
        Ok(Self {
            filename,
            source: source.into(),
            config: RuntimeConfig::default(),
            sink: None,
            env: Arc::new(ProcessEnv),
            io: Arc::new(io),
            span,
        })
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the channel every VU of this runner sends samples into.
    pub fn with_sink(mut self, sink: Sender<Metric>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_env(mut self, env: impl EnvSource + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Share an existing Tokio runtime instead of the one created by [`Runner::new`].
    pub fn with_io_runtime(mut self, io: Arc<IoRuntime>) -> Self {
        self.io = io;
        self
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> Option<Sender<Metric>> {
        self.sink.clone()
    }

    pub(crate) fn env(&self) -> Arc<dyn EnvSource> {
        self.env.clone()
    }

    pub(crate) fn io(&self) -> Arc<IoRuntime> {
        self.io.clone()
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Build a fresh VU: new JS context with the host bindings installed, a
    /// new HTTP client and an empty cookie jar. Call [`Vu::reconfigure`]
    /// before the first iteration to assign its id.
    pub fn new_vu(&self) -> Result<Vu, VuError> {
        Vu::new(self)
    }
}
