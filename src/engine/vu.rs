use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rquickjs::context::EvalOptions;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Persistent, Value};
use tokio::runtime::Runtime as IoRuntime;
use tokio_util::sync::CancellationToken;

use crate::engine::executor::HttpExecutor;
use crate::engine::{EnvSource, Runner};
use crate::error::VuError;
use crate::stats::Collector;

/// VU identity and iteration counter, readable from the script thread, batch
/// tasks and the stats collector.
#[derive(Debug, Default)]
pub struct Identity {
    id: AtomicI64,
    iteration: AtomicI64,
}

impl Identity {
    pub fn id(&self) -> i64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn iteration(&self) -> i64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self, id: i64) {
        self.id.store(id, Ordering::Relaxed);
        self.iteration.store(0, Ordering::Relaxed);
    }

    pub(crate) fn next_iteration(&self) -> i64 {
        self.iteration.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// State shared between a VU and the host functions installed in its context.
pub(crate) struct VuState {
    pub(crate) identity: Arc<Identity>,
    pub(crate) executor: Arc<HttpExecutor>,
    pub(crate) env: Arc<dyn EnvSource>,
    pub(crate) filename: String,
    io: Arc<IoRuntime>,
    aborted: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl VuState {
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Token of the iteration currently running.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn begin_iteration(&self, cancel: CancellationToken) {
        self.aborted.store(false, Ordering::SeqCst);
        *self.cancel.lock() = cancel;
    }

    /// Polled by the QuickJS interrupt handler; `true` stops the script with
    /// an exception that `try/catch` cannot intercept.
    fn should_interrupt(&self) -> bool {
        self.is_aborted() || self.cancel.lock().is_cancelled()
    }

    /// Drive a future to completion on the I/O runtime from the script thread.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.io.block_on(future)
    }
}

/// One virtual user: an isolated JavaScript context, the compiled script and
/// a private HTTP client with its own cookie jar.
///
/// Iterations on a VU are sequential; `run_once` takes `&mut self`.
pub struct Vu {
    // Dropped before the context and runtime that own it.
    script: Persistent<Function<'static>>,
    context: Context,
    runtime: rquickjs::Runtime,
    state: Arc<VuState>,
    span: tracing::Span,
}

/// The user's source becomes the body of a function expression evaluated as a
/// classic, non-strict script, so each call is one top-to-bottom run and
/// undeclared assignments land on `globalThis`. The opening brace shares the
/// first line to keep line numbers in errors aligned with the script file.
fn compile<'js>(ctx: &Ctx<'js>, filename: &str, source: &str) -> Result<Function<'js>, VuError> {
    let mut options = EvalOptions::default();
    options.strict = false;
    let wrapped = format!("(function () {{{}\n}})", source);
    ctx.eval_with_options::<Function, _>(wrapped, options)
        .catch(ctx)
        .map_err(|e| VuError::Compile {
            filename: filename.to_string(),
            message: e.to_string(),
        })
}

impl Vu {
    pub(crate) fn new(runner: &Runner) -> Result<Self, VuError> {
        let config = runner.config();
        let runtime = rquickjs::Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        let context = Context::full(&runtime)?;

        let identity = Arc::new(Identity::default());
        let collector = Collector::new(runner.sink(), identity.clone(), config.tags());
        let executor = HttpExecutor::new(config, collector).map_err(|e| VuError::Runtime(e.to_string()))?;

        let state = Arc::new(VuState {
            identity,
            executor: Arc::new(executor),
            env: runner.env(),
            filename: runner.filename().to_string(),
            io: runner.io(),
            aborted: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        });

        let script = context.with(|ctx| -> Result<_, VuError> {
            let func = compile(&ctx, runner.filename(), runner.source())?;
            crate::bridge::register_globals(&ctx, state.clone())
                .catch(&ctx)
                .map_err(|e| VuError::Bootstrap(e.to_string()))?;
            ctx.eval::<(), _>(crate::bridge::BOOTSTRAP)
                .catch(&ctx)
                .map_err(|e| VuError::Bootstrap(e.to_string()))?;
            Ok(Persistent::save(&ctx, func))
        })?;

        let interrupt_state = state.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt_state.should_interrupt())));

        tracing::debug!(script = runner.filename(), "vu created");
        Ok(Self {
            script,
            context,
            runtime,
            state,
            span: runner.span().clone(),
        })
    }

    pub fn id(&self) -> i64 {
        self.state.identity.id()
    }

    pub fn iteration(&self) -> i64 {
        self.state.identity.iteration()
    }

    /// Assign a new identity: resets the iteration counter and starts a fresh,
    /// empty cookie jar.
    pub fn reconfigure(&mut self, id: i64) -> Result<(), VuError> {
        self.state.identity.reset(id);
        self.state.executor.reset_cookies();
        tracing::debug!(vu = id, "vu reconfigured");
        Ok(())
    }

    /// Run the script once from the top. The iteration counter is bumped
    /// before the script starts.
    ///
    /// Returns [`VuError::Aborted`] if the script called `$test.abort()`,
    /// even when the script caught the resulting exception.
    pub fn run_once(&mut self, cancel: &CancellationToken) -> Result<(), VuError> {
        let _enter = self.span.enter();
        let iteration = self.state.identity.next_iteration();
        self.state.begin_iteration(cancel.clone());

        let start = Instant::now();
        let outcome = self.context.with(|ctx| -> Result<(), String> {
            let func = self.script.clone().restore(&ctx).map_err(|e| e.to_string())?;
            func.call::<_, Value>(())
                .catch(&ctx)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });

        let result = if self.state.is_aborted() {
            Err(VuError::Aborted)
        } else if cancel.is_cancelled() {
            Err(VuError::Cancelled)
        } else {
            outcome.map_err(VuError::Script)
        };

        if let Err(err) = &result {
            tracing::debug!(vu = self.id(), iteration, error = %err, "iteration failed");
        }
        self.state
            .executor
            .collector()
            .iteration(start.elapsed(), result.as_ref().err().map(|e| e.to_string()));
        result
    }
}

#[cfg(test)]
impl Vu {
    pub(crate) fn global_string(&self, name: &str) -> String {
        self.context
            .with(|ctx| ctx.globals().get::<_, String>(name))
            .unwrap_or_default()
    }
}

impl Drop for Vu {
    fn drop(&mut self) {
        self.runtime.set_interrupt_handler(None);
        self.runtime.run_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::stats::Metric;
    use crate::test_server::TestServer;
    use std::collections::HashMap;
    use std::time::Duration;

    fn runner(source: &str) -> (Runner, crossbeam_channel::Receiver<Metric>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let runner = Runner::new("script.js", source).unwrap().with_sink(tx);
        (runner, rx)
    }

    fn run(vu: &mut Vu) -> Result<(), VuError> {
        vu.run_once(&CancellationToken::new())
    }

    fn eval_json(vu: &Vu, expr: &str) -> serde_json::Value {
        vu.context.with(|ctx| {
            let json: String = ctx.eval(format!("JSON.stringify({})", expr)).unwrap();
            serde_json::from_str(&json).unwrap()
        })
    }

    #[test]
    fn test_identity_counters() {
        let identity = Identity::default();
        identity.reset(3);
        assert_eq!(identity.next_iteration(), 1);
        assert_eq!(identity.next_iteration(), 2);
        identity.reset(4);
        assert_eq!((identity.id(), identity.iteration()), (4, 0));
    }

    #[test]
    fn test_syntax_error_fails_vu_creation() {
        let (runner, _rx) = runner("let x = ;");
        match runner.new_vu() {
            Err(VuError::Compile { filename, .. }) => assert_eq!(filename, "script.js"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected compile error"),
        }
    }

    #[test]
    fn test_bootstrap_wrappers_installed() {
        let (runner, _rx) = runner("");
        let vu = runner.new_vu().unwrap();
        let kinds = eval_json(
            &vu,
            "['get','head','post','put','patch','delete','options','batch','request']\
             .map(k => typeof $http[k]).concat(['debug','info','warn','error','log'].map(k => typeof $log[k]))",
        );
        assert!(kinds.as_array().unwrap().iter().all(|k| k == "function"));
    }

    #[test]
    fn test_iteration_counter() {
        let (runner, _rx) = runner("globalThis.seen = (globalThis.seen || []).concat([$vu.iteration()]);");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        assert_eq!(vu.iteration(), 0);
        run(&mut vu).unwrap();
        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "globalThis.seen"), serde_json::json!([1, 2]));

        vu.reconfigure(2).unwrap();
        assert_eq!(vu.iteration(), 0);
        assert_eq!(vu.id(), 2);
        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "globalThis.seen"), serde_json::json!([1, 2, 1]));
    }

    #[test]
    fn test_vu_id_visible_to_script() {
        let (runner, _rx) = runner("globalThis.id = $vu.id();");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(42).unwrap();
        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "globalThis.id"), serde_json::json!(42));
    }

    #[test]
    fn test_script_runs_top_to_bottom_each_time() {
        let (runner, _rx) = runner("var local = 1; globalThis.count = (globalThis.count || 0) + local;");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        for _ in 0..3 {
            run(&mut vu).unwrap();
        }
        assert_eq!(eval_json(&vu, "globalThis.count"), serde_json::json!(3));
    }

    #[test]
    fn test_undeclared_assignment_creates_global() {
        let (runner, _rx) = runner("counter = (typeof counter === 'number' ? counter : 0) + 1;");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        run(&mut vu).unwrap();
        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "globalThis.counter"), serde_json::json!(2));
    }

    #[test]
    fn test_unhandled_error_fails_iteration() {
        let (runner, rx) = runner("throw new Error('boom');");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        match run(&mut vu) {
            Err(VuError::Script(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(rx.try_iter().any(|m| matches!(m, Metric::Iteration { error: Some(_), .. })));
    }

    #[test]
    fn test_abort_is_distinguished() {
        let (runner, _rx) = runner("$test.abort();");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        let err = run(&mut vu).unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn test_abort_survives_try_catch() {
        let (runner, _rx) = runner("try { $test.abort(); } catch (e) { globalThis.caught = e.name; }");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        assert!(run(&mut vu).unwrap_err().is_abort());
        assert_eq!(vu.global_string("caught"), "AbortError");
    }

    #[test]
    fn test_abort_flag_resets_between_iterations() {
        let (runner, _rx) = runner("if ($vu.iteration() === 1) { $test.abort(); }");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        assert!(run(&mut vu).unwrap_err().is_abort());
        assert!(run(&mut vu).is_ok());
    }

    #[test]
    fn test_cancelled_iteration() {
        let (runner, _rx) = runner("while (true) {}");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let err = vu.run_once(&cancel).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, VuError::Cancelled));
    }

    #[test]
    fn test_cancel_cuts_sleep_short() {
        let (runner, _rx) = runner("$vu.sleep(10);");
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let start = Instant::now();
        assert!(matches!(vu.run_once(&cancel), Err(VuError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_env_lookup() {
        let env: HashMap<String, String> = [("TARGET".to_string(), "http://svc".to_string())].into();
        let runner = Runner::new("script.js", "globalThis.t = $test.env('TARGET'); globalThis.m = typeof $test.env('MISSING');")
            .unwrap()
            .with_env(env);
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "[globalThis.t, globalThis.m]"), serde_json::json!(["http://svc", "undefined"]));
    }

    #[test]
    fn test_cookies_persist_until_reconfigure() {
        let server = TestServer::start();
        let source = format!(
            "if ($vu.iteration() === 1) {{ $http.get('{set}'); }} \
             globalThis.cookie = $http.get('{echo}').json().headers.cookie || null;",
            set = server.url("/set-cookie/sid/xyz"),
            echo = server.url("/echo"),
        );
        let (runner, _rx) = runner(&source);
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();

        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "globalThis.cookie"), serde_json::json!("sid=xyz"));
        run(&mut vu).unwrap();
        assert_eq!(eval_json(&vu, "globalThis.cookie"), serde_json::json!("sid=xyz"));

        vu.reconfigure(2).unwrap();
        // iteration 1 again sets the cookie, so check the jar directly
        assert_eq!(vu.state.executor.cookie_count(), 0);
    }

    #[test]
    fn test_vus_do_not_share_cookies() {
        let server = TestServer::start();
        let source = format!(
            "if ($vu.id() === 1) {{ $http.get('{set}'); }} \
             globalThis.cookie = $http.get('{echo}').json().headers.cookie || null;",
            set = server.url("/set-cookie/sid/one"),
            echo = server.url("/echo"),
        );
        let (runner, _rx) = runner(&source);
        let mut first = runner.new_vu().unwrap();
        let mut second = runner.new_vu().unwrap();
        first.reconfigure(1).unwrap();
        second.reconfigure(2).unwrap();
        run(&mut first).unwrap();
        run(&mut second).unwrap();
        assert_eq!(eval_json(&first, "globalThis.cookie"), serde_json::json!("sid=one"));
        assert_eq!(eval_json(&second, "globalThis.cookie"), serde_json::Value::Null);
    }

    #[test]
    fn test_memory_limit_applies() {
        let runner = Runner::new("script.js", "globalThis.big = new Array(1 << 24).fill(1);")
            .unwrap()
            .with_config(RuntimeConfig {
                memory_limit: Some(4 * 1024 * 1024),
                ..Default::default()
            });
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(1).unwrap();
        assert!(matches!(run(&mut vu), Err(VuError::Script(_))));
    }
}
