//! Scripted engine used by runtime and app tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::traits::{EngineHandle, InferenceEngine};
use super::types::{ChatMessage, ProgressCallback, SamplingParams, TokenDelta, TokenStream};
use crate::runtime::ModelDescriptor;
use crate::utils::EngineError;

/// Behaviour shared between the engine and the handles it hands out
#[derive(Default)]
pub struct Script {
    /// Fragments every generation yields, in order
    pub deltas: Vec<Option<String>>,
    /// Weights that fail to load
    pub failing_weights: HashSet<String>,
    /// Weights whose reload panics
    pub panicking_weights: HashSet<String>,
    /// Streams fail with an engine error after this many fragments
    pub fail_after: Option<usize>,
    /// Every generation fails before producing a stream
    pub fail_generations: bool,
    /// Progress values reported during reload
    pub progress_steps: Vec<f64>,
}

pub struct ScriptedEngine {
    pub script: Arc<Mutex<Script>>,
    pub reloads: AtomicUsize,
    pub generations: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    /// When set, reload parks until notified
    pub load_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, streams park after their first fragment until notified
    pub stream_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl ScriptedEngine {
    pub fn new(deltas: &[&str]) -> Self {
        let script = Script {
            deltas: deltas.iter().map(|d| Some(d.to_string())).collect(),
            progress_steps: vec![0.3, 0.2, 0.6],
            ..Script::default()
        };
        Self {
            script: Arc::new(Mutex::new(script)),
            reloads: AtomicUsize::new(0),
            generations: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            load_gate: Mutex::new(None),
            stream_gate: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_weights(&self, weights: &str) {
        self.script.lock().failing_weights.insert(weights.to_string());
    }

    pub fn gate_loads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.load_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn gate_streams(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.stream_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn reload(
        &self,
        descriptor: &ModelDescriptor,
        progress: ProgressCallback,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);

        let steps = self.script.lock().progress_steps.clone();
        for step in steps {
            progress(step);
        }

        let gate = self.load_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self
            .script
            .lock()
            .panicking_weights
            .contains(&descriptor.weights_path)
        {
            panic!("engine crashed loading {}", descriptor.weights_path);
        }

        if self
            .script
            .lock()
            .failing_weights
            .contains(&descriptor.weights_path)
        {
            return Err(EngineError::ModelLoad(format!(
                "cannot map {}",
                descriptor.weights_path
            )));
        }

        Ok(Box::new(ScriptedHandle {
            script: self.script.clone(),
            generations: self.generations.clone(),
            releases: self.releases.clone(),
            prompts: self.prompts.clone(),
            stream_gate: self.stream_gate.clone(),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedHandle {
    script: Arc<Mutex<Script>>,
    generations: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
    stream_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

#[async_trait]
impl EngineHandle for ScriptedHandle {
    async fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<TokenStream, EngineError> {
        let (deltas, fail_after, fail_generations) = {
            let script = self.script.lock();
            (script.deltas.clone(), script.fail_after, script.fail_generations)
        };
        if fail_generations {
            return Err(EngineError::Api("generation rejected".to_string()));
        }

        self.generations.fetch_add(1, Ordering::SeqCst);
        if let Some(last) = messages.last() {
            self.prompts.lock().push(last.content.clone());
        }
        let mut items: Vec<Result<TokenDelta, EngineError>> = deltas
            .into_iter()
            .take(params.max_tokens)
            .map(|text| Ok(TokenDelta { text }))
            .collect();
        if let Some(n) = fail_after {
            items.truncate(n);
            items.push(Err(EngineError::Stream("device lost".to_string())));
        }

        let gate = self.stream_gate.lock().clone();
        let stream = stream::unfold((items.into_iter().enumerate(), gate), |(mut iter, gate)| async move {
            let (index, item) = iter.next()?;
            if index == 1 {
                if let Some(gate) = &gate {
                    gate.notified().await;
                }
            }
            Some((item, (iter, gate)))
        });
        Ok(stream.boxed())
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
