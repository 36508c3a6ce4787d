use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::descriptor::ModelDescriptor;
use super::request::{CancelHandle, GenerationRequest};
use super::session::GenerationSession;
use super::state::{LoadFailure, RuntimePhase, RuntimeState};
use crate::constants::{
    DEFAULT_TEMPERATURE, DEFAULT_TOP_P, MAX_PENDING_PROGRESS, WARMUP_MAX_TOKENS, WARMUP_PROMPT,
};
use crate::engine::{ChatMessage, EngineHandle, InferenceEngine, ProgressCallback, SamplingParams};
use crate::utils::{EngineError, GenerationError, RuntimeError};

/// Behaviour switches for a runtime instance
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Loaded by `initialize_models`
    pub default_descriptor: ModelDescriptor,
    /// Keep the previous engine alive while a switch loads the new one, so a
    /// failed switch can fall back to it
    pub retain_previous_on_switch: bool,
    /// Run a short generation after every reload before declaring success
    pub warmup_on_load: bool,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            default_descriptor: ModelDescriptor::for_size(Default::default()),
            retain_previous_on_switch: true,
            warmup_on_load: true,
            system_prompt: None,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
        }
    }
}

/// How a generate call treats a session that is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictPolicy {
    /// Fail with `Busy`
    Reject,
    /// Cancel the running session, wait for it to end, then start
    Replace,
}

type LoadResult = Shared<BoxFuture<'static, Result<(), RuntimeError>>>;

struct LoadedModel {
    descriptor: ModelDescriptor,
    handle: Arc<dyn EngineHandle>,
}

struct PendingLoad {
    target: ModelDescriptor,
    result: LoadResult,
}

struct ActiveSession {
    id: u64,
    cancel: CancelHandle,
    /// Closed when the session's guard drops
    finished: watch::Receiver<()>,
}

/// Lifecycle bookkeeping; the lock is never held across an await
#[derive(Default)]
struct Slots {
    loaded: Option<LoadedModel>,
    pending: Option<PendingLoad>,
    session: Option<ActiveSession>,
}

struct RuntimeInner {
    engine: Arc<dyn InferenceEngine>,
    options: RuntimeOptions,
    slots: Mutex<Slots>,
    state: watch::Sender<RuntimeState>,
    next_session: AtomicU64,
}

impl RuntimeInner {
    fn publish(&self, update: impl FnOnce(&mut RuntimeState)) {
        self.state.send_modify(|state| {
            update(state);
            debug_assert!(state.is_consistent(), "inconsistent runtime state: {:?}", state);
        });
    }

    /// Raise load progress for `target` without ever lowering it
    fn report_progress(&self, target: &ModelDescriptor, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        let fraction = fraction.clamp(0.0, MAX_PENDING_PROGRESS);
        self.state.send_if_modified(|state| {
            let in_flight = match &state.phase {
                RuntimePhase::Loading { target: t } => t == target,
                RuntimePhase::Switching { to, .. } => to == target,
                _ => false,
            };
            if in_flight && fraction > state.load_progress {
                state.load_progress = fraction;
                true
            } else {
                false
            }
        });
    }
}

/// Releases the session slot when a generation ends, however it ends
struct SessionGuard {
    runtime: Arc<RuntimeInner>,
    id: u64,
    _finished: watch::Sender<()>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut slots = self.runtime.slots.lock();
        if slots.session.as_ref().map(|s| s.id) == Some(self.id) {
            slots.session = None;
            self.runtime.publish(|state| state.active_session = None);
        }
    }
}

/// Owns the inference engine lifecycle and serializes access to it
///
/// Cloning is cheap and yields another handle to the same runtime. All
/// lifecycle transitions, the session slot and the observable state are
/// guarded by the runtime itself, so callers need no external locking.
#[derive(Clone)]
pub struct ModelRuntime {
    inner: Arc<RuntimeInner>,
}

impl ModelRuntime {
    pub fn new(engine: Arc<dyn InferenceEngine>, options: RuntimeOptions) -> Self {
        let (state, _) = watch::channel(RuntimeState::default());
        Self {
            inner: Arc::new(RuntimeInner {
                engine,
                options,
                slots: Mutex::new(Slots::default()),
                state,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn engine_name(&self) -> &str {
        self.inner.engine.name()
    }

    /// Snapshot of the observable state
    pub fn state(&self) -> RuntimeState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that is notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.inner.state.subscribe()
    }

    /// Make sure a model is available, loading the default one if needed
    ///
    /// Joins a load that is already in flight instead of starting another.
    pub async fn initialize_models(&self) -> Result<(), RuntimeError> {
        let pending = {
            let slots = self.inner.slots.lock();
            if let Some(pending) = &slots.pending {
                Some(pending.result.clone())
            } else if slots.loaded.is_some() {
                return Ok(());
            } else {
                None
            }
        };

        match pending {
            Some(result) => result.await,
            None => {
                self.switch_model(self.inner.options.default_descriptor.clone())
                    .await
            }
        }
    }

    /// Load `descriptor`, replacing the current model
    ///
    /// A no-op when it is already loaded, even mid-generation. A request for
    /// the descriptor that is currently loading joins that load; any other
    /// request made while a load or a generation is in flight fails with `Busy`.
    pub async fn switch_model(&self, descriptor: ModelDescriptor) -> Result<(), RuntimeError> {
        let result = {
            let mut slots = self.inner.slots.lock();

            if let Some(pending) = &slots.pending {
                if pending.target == descriptor {
                    debug!(model = %descriptor, "joining in-flight load");
                    pending.result.clone()
                } else {
                    warn!(
                        requested = %descriptor,
                        in_flight = %pending.target,
                        "load rejected, another load is in flight"
                    );
                    return Err(RuntimeError::Busy);
                }
            } else if slots
                .loaded
                .as_ref()
                .is_some_and(|loaded| loaded.descriptor == descriptor)
            {
                debug!(model = %descriptor, "model already loaded");
                return Ok(());
            } else if slots.session.is_some() {
                warn!(requested = %descriptor, "load rejected, a generation is running");
                return Err(RuntimeError::Busy);
            } else {
                self.start_load(&mut slots, descriptor)
            }
        };

        result.await
    }

    /// Begin a load while holding the slot lock
    fn start_load(&self, slots: &mut Slots, target: ModelDescriptor) -> LoadResult {
        let from = slots.loaded.as_ref().map(|l| l.descriptor.clone());
        let released = if self.inner.options.retain_previous_on_switch {
            None
        } else {
            slots.loaded.take()
        };

        self.inner.publish(|state| {
            state.phase = match &from {
                Some(from) => RuntimePhase::Switching {
                    from: from.clone(),
                    to: target.clone(),
                },
                None => RuntimePhase::Loading {
                    target: target.clone(),
                },
            };
            state.load_progress = 0.0;
            if released.is_some() {
                state.active_descriptor = None;
            }
        });

        match &from {
            Some(from) => info!(from = %from, to = %target, "switching model"),
            None => info!(model = %target, "loading model"),
        }

        // Spawned so a caller dropping its future cannot strand the lifecycle
        let task = {
            let runtime = self.clone();
            let target = target.clone();
            tokio::spawn(async move {
                // A panicking engine must still clear the pending slot, even
                // when no caller is left to await the result
                match AssertUnwindSafe(runtime.perform_load(target.clone(), released))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let error = EngineError::Worker("load task panicked".to_string());
                        runtime.finish_load(target, Err(error)).await
                    }
                }
            })
        };

        let result = {
            let runtime = self.clone();
            let target = target.clone();
            async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        runtime
                            .finish_load(target, Err(EngineError::Worker(e.to_string())))
                            .await
                    }
                }
            }
            .boxed()
            .shared()
        };

        slots.pending = Some(PendingLoad {
            target,
            result: result.clone(),
        });
        result
    }

    async fn perform_load(
        &self,
        target: ModelDescriptor,
        released: Option<LoadedModel>,
    ) -> Result<(), RuntimeError> {
        if let Some(previous) = released {
            previous.handle.release().await;
            debug!(model = %previous.descriptor, "released previous model before reload");
        }

        let progress: ProgressCallback = {
            let inner = self.inner.clone();
            let target = target.clone();
            Arc::new(move |fraction| inner.report_progress(&target, fraction))
        };

        let loaded = match self.inner.engine.reload(&target, progress).await {
            Ok(handle) => {
                let handle: Arc<dyn EngineHandle> = Arc::from(handle);
                self.inner.report_progress(&target, 0.9);
                if self.inner.options.warmup_on_load {
                    warm_up(handle.as_ref()).await.map(|_| handle)
                } else {
                    Ok(handle)
                }
            }
            Err(e) => Err(e),
        };

        self.finish_load(target, loaded).await
    }

    /// Commit the outcome of a load and clear the pending slot
    async fn finish_load(
        &self,
        target: ModelDescriptor,
        outcome: Result<Arc<dyn EngineHandle>, EngineError>,
    ) -> Result<(), RuntimeError> {
        let (result, superseded) = {
            let mut slots = self.inner.slots.lock();
            slots.pending = None;

            match outcome {
                Ok(handle) => {
                    let superseded = slots.loaded.replace(LoadedModel {
                        descriptor: target.clone(),
                        handle,
                    });
                    self.inner.publish(|state| {
                        state.phase = RuntimePhase::Loaded {
                            descriptor: target.clone(),
                        };
                        state.active_descriptor = Some(target.clone());
                        state.load_progress = 1.0;
                        state.last_failure = None;
                    });
                    info!(model = %target, "model loaded");
                    (Ok(()), superseded)
                }
                Err(e) => {
                    let failure = LoadFailure {
                        descriptor: target.clone(),
                        error: e.to_string(),
                    };
                    match &slots.loaded {
                        Some(previous) => {
                            warn!(
                                model = %target,
                                fallback = %previous.descriptor,
                                error = %e,
                                "switch failed, keeping previous model"
                            );
                            let fallback = previous.descriptor.clone();
                            self.inner.publish(|state| {
                                state.phase = RuntimePhase::Loaded {
                                    descriptor: fallback.clone(),
                                };
                                state.active_descriptor = Some(fallback);
                                state.last_failure = Some(failure);
                            });
                        }
                        None => {
                            warn!(model = %target, error = %e, "model load failed");
                            self.inner.publish(|state| {
                                state.phase = RuntimePhase::Failed {
                                    descriptor: target.clone(),
                                    error: e.to_string(),
                                };
                                state.active_descriptor = None;
                                state.last_failure = Some(failure);
                            });
                        }
                    }
                    (Err(RuntimeError::Engine(e)), None)
                }
            }
        };

        if let Some(previous) = superseded {
            previous.handle.release().await;
            debug!(model = %previous.descriptor, "released superseded model");
        }
        result
    }

    /// Release the engine and return to `Unloaded`
    pub async fn unload(&self) -> Result<(), RuntimeError> {
        let previous = {
            let mut slots = self.inner.slots.lock();
            if slots.pending.is_some() || slots.session.is_some() {
                return Err(RuntimeError::Busy);
            }
            let previous = slots.loaded.take();
            self.inner.publish(|state| {
                state.phase = RuntimePhase::Unloaded;
                state.active_descriptor = None;
                state.load_progress = 0.0;
            });
            previous
        };

        if let Some(previous) = previous {
            previous.handle.release().await;
            info!(model = %previous.descriptor, "model unloaded");
        }
        Ok(())
    }

    /// Request built from the runtime's defaults
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        let options = &self.inner.options;
        let mut request = GenerationRequest::new(prompt)
            .with_temperature(options.temperature)
            .with_top_p(options.top_p);
        if let Some(system) = &options.system_prompt {
            request = request.with_system_prompt(system.clone());
        }
        request
    }

    /// Generate a complete response, failing with `Busy` if a generation is
    /// already running
    pub async fn generate_text(
        &self,
        prompt: &str,
        max_tokens: usize,
    ) -> Result<String, GenerationError> {
        self.generate(self.request(prompt).with_max_tokens(max_tokens))
            .await
    }

    /// Like `generate_text` with full control over the request
    pub async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        self.run_generation(request, ConflictPolicy::Reject).await
    }

    /// Stream a response to the request's sink
    ///
    /// A running generation is cancelled and awaited first ("stop then
    /// send"); this is the only entry point that preempts.
    pub async fn generate_text_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<(), GenerationError> {
        self.run_generation(request, ConflictPolicy::Replace)
            .await
            .map(|_| ())
    }

    /// Cancel the running generation, if any; returns whether one was running
    pub fn cancel_active(&self) -> bool {
        let slots = self.inner.slots.lock();
        match &slots.session {
            Some(session) => {
                info!(session = session.id, "cancelling active generation");
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_generation(
        &self,
        request: GenerationRequest,
        policy: ConflictPolicy,
    ) -> Result<String, GenerationError> {
        request.validate()?;

        let (handle, session, _guard) = loop {
            let mut previous = {
                let mut slots = self.inner.slots.lock();
                let handle = match (&slots.pending, &slots.loaded) {
                    (None, Some(loaded)) => loaded.handle.clone(),
                    _ => return Err(GenerationError::NotLoaded),
                };

                if let Some(active) = &slots.session {
                    if policy == ConflictPolicy::Reject {
                        debug!(active = active.id, "generation rejected, runtime busy");
                        return Err(GenerationError::Busy);
                    }
                    debug!(active = active.id, "replacing running generation");
                    active.cancel.cancel();
                    active.finished.clone()
                } else {
                    let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
                    let (finished_tx, finished_rx) = watch::channel(());
                    slots.session = Some(ActiveSession {
                        id,
                        cancel: request.cancel.clone(),
                        finished: finished_rx,
                    });
                    self.inner.publish(|state| state.active_session = Some(id));

                    let guard = SessionGuard {
                        runtime: self.inner.clone(),
                        id,
                        _finished: finished_tx,
                    };
                    break (handle, GenerationSession::new(id), guard);
                }
            };

            // Resolves with an error once the replaced session's guard drops
            let _ = previous.changed().await;
        };

        let span = info_span!("generation", session = session.id());
        async move {
            debug!(?request, "generation started");

            let stream = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => {
                    return Err(GenerationError::Cancelled { partial: String::new() });
                }
                stream = handle.generate_stream(request.messages(), request.params()) => stream?,
            };

            let inner = self.inner.clone();
            session
                .run(stream, &request, move |rate| {
                    inner.publish(|state| state.tokens_per_second = rate)
                })
                .await
        }
        .instrument(span)
        .await
    }
}

/// Short generation proving a freshly loaded model actually produces output
async fn warm_up(handle: &dyn EngineHandle) -> Result<(), EngineError> {
    let params = SamplingParams {
        max_tokens: WARMUP_MAX_TOKENS,
        ..SamplingParams::default()
    };
    let mut stream = handle
        .generate_stream(vec![ChatMessage::user(WARMUP_PROMPT)], params)
        .await
        .map_err(|e| EngineError::Warmup(e.to_string()))?;

    while let Some(item) = stream.next().await {
        item.map_err(|e| EngineError::Warmup(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedEngine;
    use crate::runtime::ModelSize;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn lite() -> ModelDescriptor {
        ModelDescriptor::for_size(ModelSize::Lite)
    }

    fn max() -> ModelDescriptor {
        ModelDescriptor::for_size(ModelSize::Max)
    }

    fn runtime_with(engine: &Arc<ScriptedEngine>, retain: bool) -> ModelRuntime {
        let options = RuntimeOptions {
            default_descriptor: lite(),
            retain_previous_on_switch: retain,
            warmup_on_load: false,
            ..RuntimeOptions::default()
        };
        ModelRuntime::new(engine.clone(), options)
    }

    fn setup(deltas: &[&str]) -> (Arc<ScriptedEngine>, ModelRuntime) {
        let engine = Arc::new(ScriptedEngine::new(deltas));
        let runtime = runtime_with(&engine, true);
        (engine, runtime)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initialize_then_generate() {
        let (engine, runtime) = setup(&["Hi", " there", "!"]);

        runtime.initialize_models().await.unwrap();

        let state = runtime.state();
        assert_eq!(state.phase, RuntimePhase::Loaded { descriptor: lite() });
        assert_eq!(state.active_descriptor, Some(lite()));
        assert_eq!(state.load_progress, 1.0);
        assert!(state.is_consistent());

        let text = runtime.generate_text("Hello", 5).await.unwrap();
        assert_eq!(text, "Hi there!");
        assert_eq!(runtime.state().phase, RuntimePhase::Loaded { descriptor: lite() });
        assert_eq!(*engine.prompts.lock(), vec!["Hello".to_string()]);

        // Initializing again with a model loaded does nothing
        runtime.initialize_models().await.unwrap();
        assert_eq!(engine.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_switch_to_loaded_descriptor_does_not_reload() {
        let (engine, runtime) = setup(&["x"]);
        runtime.switch_model(lite()).await.unwrap();
        runtime.switch_model(lite()).await.unwrap();
        runtime.switch_model(lite()).await.unwrap();
        assert_eq!(engine.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_serial_switches_end_on_last_descriptor() {
        let (engine, runtime) = setup(&["x"]);
        for descriptor in [lite(), max(), lite(), max()] {
            runtime.switch_model(descriptor).await.unwrap();
        }
        assert_eq!(runtime.state().active_descriptor, Some(max()));
        assert_eq!(engine.reload_count(), 4);
        // Every superseded handle was released
        assert_eq!(engine.releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_switch_falls_back_to_retained_model() {
        let (engine, runtime) = setup(&["still", " here"]);
        engine.fail_weights(&max().weights_path);

        runtime.switch_model(lite()).await.unwrap();
        let err = runtime.switch_model(max()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Engine(EngineError::ModelLoad(_))));

        let state = runtime.state();
        assert_eq!(state.phase, RuntimePhase::Loaded { descriptor: lite() });
        assert_eq!(state.active_descriptor, Some(lite()));
        assert_eq!(state.last_failure.as_ref().map(|f| &f.descriptor), Some(&max()));
        assert!(state.is_consistent());

        // The retained engine still serves generations
        assert_eq!(runtime.generate_text("ping", 16).await.unwrap(), "still here");
        assert_eq!(engine.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_switch_without_retained_model_reports_failed() {
        let engine = Arc::new(ScriptedEngine::new(&["x"]));
        let runtime = runtime_with(&engine, false);
        engine.fail_weights(&max().weights_path);

        runtime.switch_model(lite()).await.unwrap();
        assert!(runtime.switch_model(max()).await.is_err());

        let state = runtime.state();
        assert!(matches!(
            &state.phase,
            RuntimePhase::Failed { descriptor, .. } if *descriptor == max()
        ));
        assert_eq!(state.active_descriptor, None);
        assert_eq!(engine.releases.load(Ordering::SeqCst), 1);

        let called = Arc::new(AtomicU64::new(0));
        let counter = called.clone();
        let request = runtime
            .request("hello")
            .on_token(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(runtime.generate(request).await, Err(GenerationError::NotLoaded));
        assert_eq!(called.load(Ordering::SeqCst), 0);

        // Retrying after the failure works
        runtime.switch_model(lite()).await.unwrap();
        assert!(runtime.state().is_loaded());
    }

    #[tokio::test]
    async fn test_serial_switch_with_failure_keeps_last_success() {
        let (engine, runtime) = setup(&["x"]);
        engine.fail_weights(&max().weights_path);

        let mut last_success = None;
        for descriptor in [lite(), max(), max()] {
            if runtime.switch_model(descriptor.clone()).await.is_ok() {
                last_success = Some(descriptor);
            }
        }
        assert_eq!(runtime.state().active_descriptor, last_success);
        assert_eq!(runtime.state().active_descriptor, Some(lite()));
    }

    #[tokio::test]
    async fn test_generate_before_load_is_not_loaded() {
        let (_, runtime) = setup(&["x"]);
        let called = Arc::new(AtomicU64::new(0));
        let counter = called.clone();

        let request = runtime.request("hi").on_token(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(
            runtime.generate_text_stream(request).await,
            Err(GenerationError::NotLoaded)
        );
        assert_eq!(runtime.generate_text("hi", 4).await, Err(GenerationError::NotLoaded));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce_or_reject() {
        let (engine, runtime) = setup(&["x"]);
        let gate = engine.gate_loads();

        let first = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.switch_model(lite()).await }
        });
        wait_until(|| engine.reload_count() == 1).await;

        // Same target joins, different target is rejected
        let joined = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.switch_model(lite()).await }
        });
        assert_eq!(runtime.switch_model(max()).await, Err(RuntimeError::Busy));
        assert!(runtime.state().phase.is_busy());

        // Generation during a load never sees a half-loaded model
        assert_eq!(runtime.generate_text("hi", 4).await, Err(GenerationError::NotLoaded));

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(joined.await.unwrap(), Ok(()));
        assert_eq!(engine.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_generate_during_switch_is_not_loaded() {
        let (engine, runtime) = setup(&["x"]);
        runtime.switch_model(lite()).await.unwrap();

        let gate = engine.gate_loads();
        let switch = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.switch_model(max()).await }
        });
        wait_until(|| engine.reload_count() == 2).await;

        assert_eq!(
            runtime.state().phase,
            RuntimePhase::Switching {
                from: lite(),
                to: max()
            }
        );
        assert_eq!(runtime.generate_text("hi", 4).await, Err(GenerationError::NotLoaded));

        gate.notify_one();
        switch.await.unwrap().unwrap();
        assert_eq!(runtime.state().active_descriptor, Some(max()));
    }

    #[tokio::test]
    async fn test_load_progress_is_monotonic_and_completes() {
        let (engine, runtime) = setup(&["x"]);
        let gate = engine.gate_loads();

        let load = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.initialize_models().await }
        });
        wait_until(|| engine.reload_count() == 1).await;

        // Scripted steps are 0.3, 0.2, 0.6: the dip is ignored
        assert_eq!(runtime.state().load_progress, 0.6);

        gate.notify_one();
        load.await.unwrap().unwrap();
        assert_eq!(runtime.state().load_progress, 1.0);

        // A new operation starts from zero
        let gate = engine.gate_loads();
        engine.script.lock().progress_steps = vec![];
        let switch = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.switch_model(max()).await }
        });
        wait_until(|| engine.reload_count() == 2).await;
        assert_eq!(runtime.state().load_progress, 0.0);
        gate.notify_one();
        switch.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_aggregate_generate_is_busy() {
        let (engine, runtime) = setup(&["one", " two"]);
        runtime.initialize_models().await.unwrap();
        let gate = engine.gate_streams();

        let first = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.generate_text("first", 8).await }
        });
        wait_until(|| runtime.state().active_session.is_some()).await;

        assert_eq!(runtime.generate_text("second", 8).await, Err(GenerationError::Busy));

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok("one two".to_string()));
        assert_eq!(runtime.state().active_session, None);
        assert_eq!(engine.generations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_generate_replaces_running_session() {
        let (engine, runtime) = setup(&["a", "b", "c"]);
        runtime.initialize_models().await.unwrap();
        let gate = engine.gate_streams();

        let first_seen = Arc::new(Mutex::new(String::new()));
        let first = tokio::spawn({
            let runtime = runtime.clone();
            let sink = first_seen.clone();
            async move {
                let request = runtime
                    .request("first")
                    .on_token(move |t| sink.lock().push_str(t));
                runtime.generate_text_stream(request).await
            }
        });
        wait_until(|| first_seen.lock().as_str() == "a").await;

        // The second stream runs ungated
        *engine.stream_gate.lock() = None;

        let collected = Arc::new(Mutex::new(String::new()));
        let sink = collected.clone();
        let second = runtime
            .request("second")
            .on_token(move |t| sink.lock().push_str(t));
        runtime.generate_text_stream(second).await.unwrap();

        assert_eq!(
            first.await.unwrap(),
            Err(GenerationError::Cancelled {
                partial: "a".to_string()
            })
        );
        assert_eq!(*collected.lock(), "abc");
        drop(gate);
    }

    #[tokio::test]
    async fn test_cancel_active_stops_delivery() {
        let (engine, runtime) = setup(&["a", "b", "c"]);
        runtime.initialize_models().await.unwrap();
        let gate = engine.gate_streams();

        let delivered = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = delivered.clone();
        let request = runtime.request("hi").on_token(move |t| sink.lock().push(t.to_string()));
        let stream = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.generate_text_stream(request).await }
        });
        wait_until(|| delivered.lock().len() == 1).await;

        assert!(runtime.cancel_active());
        let result = stream.await.unwrap();
        assert_eq!(
            result,
            Err(GenerationError::Cancelled {
                partial: "a".to_string()
            })
        );

        // Releasing the engine afterwards must not deliver anything else
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*delivered.lock(), vec!["a".to_string()]);
        assert!(!runtime.cancel_active());
        assert_eq!(runtime.state().active_session, None);
    }

    #[tokio::test]
    async fn test_tokens_per_second_waits_for_first_fragment() {
        let engine = Arc::new(ScriptedEngine::new(&[]));
        engine.script.lock().deltas = vec![None, Some(String::new())];
        let runtime = runtime_with(&engine, true);
        runtime.initialize_models().await.unwrap();

        assert_eq!(runtime.generate_text("hi", 4).await, Ok(String::new()));
        assert_eq!(runtime.state().tokens_per_second, 0.0);

        engine.script.lock().deltas = vec![None, Some("abcdefgh".to_string())];
        runtime.generate_text("hi", 4).await.unwrap();
        assert!(runtime.state().tokens_per_second > 0.0);
    }

    #[tokio::test]
    async fn test_engine_failure_ends_only_the_session() {
        let (engine, runtime) = setup(&["a", "b", "c"]);
        runtime.initialize_models().await.unwrap();

        engine.script.lock().fail_after = Some(1);
        let result = runtime.generate_text("hi", 8).await;
        assert!(matches!(result, Err(GenerationError::EngineFailure(_))));
        assert!(runtime.state().is_loaded());

        engine.script.lock().fail_after = None;
        assert_eq!(runtime.generate_text("hi", 8).await, Ok("abc".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_engine() {
        let (engine, runtime) = setup(&["a"]);
        runtime.initialize_models().await.unwrap();
        assert!(matches!(
            runtime.generate_text("hi", 0).await,
            Err(GenerationError::InvalidRequest(_))
        ));
        assert_eq!(engine.generations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unload_releases_engine() {
        let (engine, runtime) = setup(&["a"]);
        runtime.initialize_models().await.unwrap();

        runtime.unload().await.unwrap();
        let state = runtime.state();
        assert_eq!(state.phase, RuntimePhase::Unloaded);
        assert_eq!(state.load_progress, 0.0);
        assert_eq!(state.active_descriptor, None);
        assert_eq!(engine.releases.load(Ordering::SeqCst), 1);

        // Unloading twice is harmless
        runtime.unload().await.unwrap();
        assert_eq!(runtime.generate_text("hi", 4).await, Err(GenerationError::NotLoaded));
    }

    #[tokio::test]
    async fn test_lifecycle_changes_rejected_while_generating() {
        let (engine, runtime) = setup(&["a", "b"]);
        runtime.initialize_models().await.unwrap();
        let gate = engine.gate_streams();

        let running = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.generate_text("hi", 8).await }
        });
        wait_until(|| runtime.state().active_session.is_some()).await;

        assert_eq!(runtime.switch_model(max()).await, Err(RuntimeError::Busy));
        assert_eq!(runtime.unload().await, Err(RuntimeError::Busy));

        gate.notify_one();
        running.await.unwrap().unwrap();
        runtime.switch_model(max()).await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_to_active_model_while_generating_is_a_no_op() {
        let (engine, runtime) = setup(&["a", "b"]);
        runtime.initialize_models().await.unwrap();
        let gate = engine.gate_streams();

        let running = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.generate_text("hi", 8).await }
        });
        wait_until(|| runtime.state().active_session.is_some()).await;

        assert_eq!(runtime.switch_model(lite()).await, Ok(()));
        assert_eq!(runtime.initialize_models().await, Ok(()));
        assert!(runtime.state().active_session.is_some());

        gate.notify_one();
        assert_eq!(running.await.unwrap(), Ok("ab".to_string()));
        assert_eq!(engine.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_load_without_callers_clears_pending() {
        let (engine, runtime) = setup(&["x"]);
        engine
            .script
            .lock()
            .panicking_weights
            .insert(max().weights_path);
        let gate = engine.gate_loads();

        let caller = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.switch_model(max()).await }
        });
        wait_until(|| engine.reload_count() == 1).await;
        caller.abort();
        let _ = caller.await;

        gate.notify_one();
        wait_until(|| runtime.state().phase.is_failed()).await;
        assert!(matches!(
            runtime.state().last_failure.map(|f| f.error),
            Some(error) if error.contains("panicked")
        ));

        *engine.load_gate.lock() = None;
        runtime.switch_model(lite()).await.unwrap();
        assert_eq!(runtime.state().active_descriptor, Some(lite()));
    }

    #[tokio::test]
    async fn test_dropped_generation_frees_the_slot() {
        let (engine, runtime) = setup(&["a", "b"]);
        runtime.initialize_models().await.unwrap();
        let _gate = engine.gate_streams();

        let running = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.generate_text("hi", 8).await }
        });
        wait_until(|| runtime.state().active_session.is_some()).await;

        running.abort();
        let _ = running.await;
        assert_eq!(runtime.state().active_session, None);
        assert!(!runtime.cancel_active());
    }

    #[tokio::test]
    async fn test_warmup_failure_fails_the_load() {
        let engine = Arc::new(ScriptedEngine::new(&["a"]));
        engine.script.lock().fail_generations = true;
        let options = RuntimeOptions {
            default_descriptor: lite(),
            warmup_on_load: true,
            ..RuntimeOptions::default()
        };
        let runtime = ModelRuntime::new(engine.clone(), options);

        let err = runtime.initialize_models().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Engine(EngineError::Warmup(_))));
        assert!(runtime.state().phase.is_failed());

        engine.script.lock().fail_generations = false;
        runtime.initialize_models().await.unwrap();
        // The successful warm-up ran once through the engine
        assert_eq!(engine.generations.load(Ordering::SeqCst), 1);
    }
}
