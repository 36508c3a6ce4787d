use futures::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::request::GenerationRequest;
use crate::constants::{CHARS_PER_TOKEN, MIN_ELAPSED_SECS};
use crate::engine::TokenStream;
use crate::utils::GenerationError;

/// Approximate throughput from a character count
///
/// Characters are converted to tokens with a fixed ratio; elapsed time is
/// floored so a near-instant first fragment cannot divide by zero.
pub fn estimate_tokens_per_second(produced_characters: usize, elapsed: Duration) -> f64 {
    let approx_tokens = (produced_characters / CHARS_PER_TOKEN).max(1) as f64;
    approx_tokens / elapsed.as_secs_f64().max(MIN_ELAPSED_SECS)
}

/// Bookkeeping for one in-flight completion
#[derive(Debug)]
pub struct GenerationSession {
    id: u64,
    started_at: Instant,
    produced_characters: usize,
    buffer: String,
}

impl GenerationSession {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            produced_characters: 0,
            buffer: String::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tokens_per_second(&self) -> f64 {
        estimate_tokens_per_second(self.produced_characters, self.started_at.elapsed())
    }

    /// Pull fragments from `stream` until it ends, fails or is cancelled
    ///
    /// `on_rate` is called with the updated throughput after every non-empty
    /// fragment and never before the first. On success the full text is
    /// returned; on cancellation the delivered text comes back in
    /// `GenerationError::Cancelled`.
    pub(crate) async fn run(
        mut self,
        mut stream: TokenStream,
        request: &GenerationRequest,
        on_rate: impl Fn(f64),
    ) -> Result<String, GenerationError> {
        loop {
            if request.cancel.is_cancelled() {
                return Err(self.into_cancelled());
            }

            let next = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => return Err(self.into_cancelled()),
                item = stream.next() => item,
            };

            let delta = match next {
                Some(Ok(delta)) => delta,
                Some(Err(e)) => {
                    warn!(session = self.id, error = %e, "engine failed mid-stream");
                    return Err(GenerationError::EngineFailure(e.to_string()));
                }
                None => break,
            };

            let Some(text) = delta.content() else {
                continue;
            };

            // Checked again right before delivery: nothing reaches the sink
            // once cancellation has been requested
            if request.cancel.is_cancelled() {
                return Err(self.into_cancelled());
            }

            if let Some(sink) = &request.on_token {
                sink(text);
            }
            self.buffer.push_str(text);
            self.produced_characters += text.chars().count();
            on_rate(self.tokens_per_second());
        }

        debug!(
            session = self.id,
            chars = self.produced_characters,
            tokens_per_second = self.tokens_per_second(),
            "generation finished"
        );
        Ok(self.buffer)
    }

    fn into_cancelled(self) -> GenerationError {
        debug!(
            session = self.id,
            chars = self.produced_characters,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "generation cancelled"
        );
        GenerationError::Cancelled {
            partial: self.buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TokenDelta;
    use crate::utils::EngineError;
    use futures::stream;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn script(items: Vec<Result<TokenDelta, EngineError>>) -> TokenStream {
        stream::iter(items).boxed()
    }

    fn collecting_request(prompt: &str) -> (GenerationRequest, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let request = GenerationRequest::new(prompt).on_token(move |t| sink.lock().push(t.to_string()));
        (request, seen)
    }

    #[test]
    fn test_rate_estimate_floors_tokens_and_elapsed() {
        // 3 chars still count as one token
        assert_eq!(estimate_tokens_per_second(3, Duration::from_secs(1)), 1.0);
        assert_eq!(estimate_tokens_per_second(40, Duration::from_secs(2)), 5.0);
        // Zero elapsed uses the epsilon instead of dividing by zero
        assert_eq!(estimate_tokens_per_second(0, Duration::ZERO), 1000.0);
    }

    #[tokio::test]
    async fn test_run_forwards_non_empty_fragments() {
        let (request, seen) = collecting_request("hi");
        let rates = Arc::new(Mutex::new(Vec::new()));
        let rates_sink = rates.clone();

        let text = GenerationSession::new(1)
            .run(
                script(vec![
                    Ok(TokenDelta::empty()),
                    Ok(TokenDelta::text("Hello")),
                    Ok(TokenDelta::text("")),
                    Ok(TokenDelta::text(" world")),
                ]),
                &request,
                move |rate| rates_sink.lock().push(rate),
            )
            .await
            .unwrap();

        assert_eq!(text, "Hello world");
        assert_eq!(*seen.lock(), vec!["Hello", " world"]);
        // One update per non-empty fragment
        assert_eq!(rates.lock().len(), 2);
        assert!(rates.lock().iter().all(|r| *r > 0.0));
    }

    #[tokio::test]
    async fn test_no_rate_update_without_content() {
        let (request, _) = collecting_request("hi");
        let updates = Arc::new(Mutex::new(0));
        let counter = updates.clone();

        let text = GenerationSession::new(2)
            .run(
                script(vec![Ok(TokenDelta::empty()), Ok(TokenDelta::text(""))]),
                &request,
                move |_| *counter.lock() += 1,
            )
            .await
            .unwrap();

        assert_eq!(text, "");
        assert_eq!(*updates.lock(), 0);
    }

    #[tokio::test]
    async fn test_engine_error_is_terminal() {
        let (request, seen) = collecting_request("hi");
        let result = GenerationSession::new(3)
            .run(
                script(vec![
                    Ok(TokenDelta::text("a")),
                    Err(EngineError::Stream("device lost".to_string())),
                    Ok(TokenDelta::text("b")),
                ]),
                &request,
                |_| {},
            )
            .await;

        assert_eq!(
            result,
            Err(GenerationError::EngineFailure(
                "Stream error: device lost".to_string()
            ))
        );
        assert_eq!(*seen.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancel_from_sink_stops_delivery_and_returns_partial() {
        for n in 0..4 {
            let seen = Arc::new(Mutex::new(Vec::<String>::new()));
            let cancel = crate::runtime::CancelHandle::new();
            if n == 0 {
                cancel.cancel();
            }
            let request = {
                let seen = seen.clone();
                let cancel = cancel.clone();
                GenerationRequest::new("hi")
                    .with_cancel(cancel.clone())
                    .on_token(move |t| {
                        let mut seen = seen.lock();
                        seen.push(t.to_string());
                        if seen.len() == n {
                            cancel.cancel();
                        }
                    })
            };

            let fragments = (0..6).map(|i| Ok(TokenDelta::text(format!("t{} ", i)))).collect();
            let result = GenerationSession::new(4).run(script(fragments), &request, |_| {}).await;

            assert_eq!(seen.lock().len(), n);
            let expected: String = (0..n).map(|i| format!("t{} ", i)).collect();
            assert_eq!(result, Err(GenerationError::Cancelled { partial: expected }));
        }
    }

    #[tokio::test]
    async fn test_cancel_while_engine_is_silent() {
        let request = GenerationRequest::new("hi");
        let cancel = request.cancel.clone();

        // A stream that never yields
        let stalled: TokenStream = stream::pending().boxed();
        let run = GenerationSession::new(5).run(stalled, &request, |_| {});

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(run, canceller);
        assert_eq!(
            result,
            Err(GenerationError::Cancelled {
                partial: String::new()
            })
        );
    }
}
