//! Adapter from a publisher of raw byte chunks to a subscriber of text lines
//!
//! [`LineSubscriber`] buffers partial lines across chunks and hands complete
//! lines downstream as they are demanded. The completion signal keeps its
//! meaning across the adapter: when the downstream subscriber reports that all
//! of its processing is done, the upstream subscription is completed, and a
//! downstream cancel cancels upstream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::config::{Charset, LineConfig};
use crate::error::{FlowError, FlowResult};
use crate::subscription::{CompletionSubscription, Subscriber, Subscription};

enum Separator {
    /// `\n`, `\r\n` or a lone `\r`
    Universal,
    Exact(Vec<u8>),
}

impl Separator {
    /// Move every complete line out of `pending`. A trailing `\r` is held back
    /// unless `at_end`, since the next chunk may start with `\n`.
    fn split(&self, pending: &mut Vec<u8>, at_end: bool) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut start = 0;
        match self {
            Separator::Universal => {
                let mut i = 0;
                while i < pending.len() {
                    match pending[i] {
                        b'\n' => {
                            lines.push(pending[start..i].to_vec());
                            start = i + 1;
                        }
                        b'\r' => {
                            if i + 1 == pending.len() && !at_end {
                                break;
                            }
                            lines.push(pending[start..i].to_vec());
                            if pending.get(i + 1) == Some(&b'\n') {
                                i += 1;
                            }
                            start = i + 1;
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            Separator::Exact(separator) => {
                while let Some(offset) = pending[start..]
                    .windows(separator.len())
                    .position(|window| window == separator.as_slice())
                {
                    lines.push(pending[start..start + offset].to_vec());
                    start += offset + separator.len();
                }
            }
        }
        pending.drain(..start);
        lines
    }
}

#[derive(Default)]
struct LineState {
    /// Bytes of the line currently being assembled
    partial: Vec<u8>,
    lines: VecDeque<String>,
    /// Lines requested downstream and not yet delivered
    demand: usize,
    /// A chunk was requested upstream and has not arrived yet
    chunk_requested: bool,
    /// Set once upstream has ended, holding its error if it failed
    upstream_end: Option<Option<FlowError>>,
    end_signalled: bool,
    /// Some task is currently delivering to downstream
    draining: bool,
}

enum Step {
    Deliver(String),
    RequestChunk,
    End(Option<FlowError>),
    Idle,
}

struct Shared {
    id: String,
    charset: Charset,
    separator: Separator,
    state: Mutex<LineState>,
    /// Cleared when downstream terminates so the reference cycle through its
    /// subscription is broken.
    downstream: Mutex<Option<Arc<dyn Subscriber<String>>>>,
    upstream: OnceLock<Arc<dyn CompletionSubscription>>,
    published: AtomicU64,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downstream(&self) -> Option<Arc<dyn Subscriber<String>>> {
        self.downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn release_downstream(&self) {
        self.downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn decode_into(&self, state: &mut LineState, raw: Vec<Vec<u8>>) {
        state
            .lines
            .extend(raw.iter().map(|line| self.charset.decode(line)));
    }

    /// Deliver what downstream has asked for, one step at a time. Only one
    /// caller drains at once; the others leave their update in the state for
    /// the active drainer to pick up.
    fn drain(&self) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let step = {
                let mut state = self.lock();
                if state.demand > 0 && !state.lines.is_empty() {
                    state.demand -= 1;
                    state.lines.pop_front().map_or(Step::Idle, Step::Deliver)
                } else if state.lines.is_empty() && state.upstream_end.is_some() && !state.end_signalled {
                    state.end_signalled = true;
                    Step::End(state.upstream_end.clone().flatten())
                } else if state.demand > 0
                    && state.lines.is_empty()
                    && state.upstream_end.is_none()
                    && !state.chunk_requested
                {
                    state.chunk_requested = true;
                    Step::RequestChunk
                } else {
                    state.draining = false;
                    return;
                }
            };
            match step {
                Step::Deliver(line) => {
                    if let Some(downstream) = self.downstream() {
                        self.published.fetch_add(1, Ordering::Relaxed);
                        downstream.on_next(line);
                    }
                }
                Step::RequestChunk => {
                    if let Some(upstream) = self.upstream.get() {
                        upstream.request(1);
                    }
                }
                Step::End(error) => {
                    let Some(downstream) = self.downstream() else {
                        continue;
                    };
                    match error {
                        Some(e) => downstream.on_error(e),
                        None => {
                            log::info!(
                                "Line adapter {} published {} lines",
                                self.id,
                                self.published.load(Ordering::Relaxed)
                            );
                            downstream.on_complete();
                        }
                    }
                }
                Step::Idle => {}
            }
        }
    }
}

/// The subscription handed downstream. Demand is counted in lines; the
/// terminal signals go straight upstream.
struct LineSubscription {
    shared: Arc<Shared>,
}

impl Subscription for LineSubscription {
    fn request(&self, n: usize) {
        {
            let mut state = self.shared.lock();
            state.demand = state.demand.saturating_add(n);
        }
        self.shared.drain();
    }

    fn cancel(&self) {
        log::debug!("Line adapter {} cancelled downstream", self.shared.id);
        if let Some(upstream) = self.shared.upstream.get() {
            upstream.cancel();
        }
        self.shared.release_downstream();
    }
}

impl CompletionSubscription for LineSubscription {
    fn complete(&self) {
        log::debug!("Line adapter {} completed downstream", self.shared.id);
        if let Some(upstream) = self.shared.upstream.get() {
            upstream.complete();
        }
        self.shared.release_downstream();
    }
}

/// Subscribes to chunks of bytes and publishes the text lines they carry to
/// a downstream [`Subscriber<String>`].
///
/// Upstream is asked for one chunk at a time, and only while downstream has
/// unmet demand and no complete line is buffered. On upstream completion any
/// trailing partial line is published as the last line. On upstream error
/// the buffered complete lines are still delivered before the error; the
/// partial line is dropped.
pub struct LineSubscriber {
    shared: Arc<Shared>,
}

impl LineSubscriber {
    pub fn new(downstream: Arc<dyn Subscriber<String>>, config: LineConfig) -> FlowResult<Self> {
        config.validate()?;
        let separator = match &config.separator {
            None => Separator::Universal,
            Some(text) => Separator::Exact(config.charset.encode(text)?),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                id: uuid::Uuid::new_v4().to_string(),
                charset: config.charset,
                separator,
                state: Mutex::new(LineState::default()),
                downstream: Mutex::new(Some(downstream)),
                upstream: OnceLock::new(),
                published: AtomicU64::new(0),
            }),
        })
    }

    /// Lines handed downstream so far.
    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }
}

impl Subscriber<Vec<u8>> for LineSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn CompletionSubscription>) {
        if let Err(duplicate) = self.shared.upstream.set(subscription) {
            log::warn!(
                "Line adapter {} is already subscribed; cancelling the new subscription",
                self.shared.id
            );
            duplicate.cancel();
            return;
        }
        let Some(downstream) = self.shared.downstream() else {
            return;
        };
        let subscription: Arc<dyn CompletionSubscription> = Arc::new(LineSubscription {
            shared: Arc::clone(&self.shared),
        });
        downstream.on_subscribe(subscription);
    }

    fn on_next(&self, chunk: Vec<u8>) {
        {
            let mut state = self.shared.lock();
            state.chunk_requested = false;
            state.partial.extend_from_slice(&chunk);
            let mut partial = std::mem::take(&mut state.partial);
            let raw = self.shared.separator.split(&mut partial, false);
            state.partial = partial;
            self.shared.decode_into(&mut state, raw);
        }
        self.shared.drain();
    }

    fn on_error(&self, error: FlowError) {
        {
            let mut state = self.shared.lock();
            if !state.partial.is_empty() {
                log::warn!(
                    "Line adapter {} dropped {} bytes of an unterminated line",
                    self.shared.id,
                    state.partial.len()
                );
                state.partial.clear();
            }
            state.upstream_end = Some(Some(error));
        }
        self.shared.drain();
    }

    fn on_complete(&self) {
        {
            let mut state = self.shared.lock();
            let mut partial = std::mem::take(&mut state.partial);
            let mut raw = self.shared.separator.split(&mut partial, true);
            if !partial.is_empty() {
                raw.push(partial);
            }
            self.shared.decode_into(&mut state, raw);
            state.upstream_end = Some(None);
        }
        self.shared.drain();
    }
}
