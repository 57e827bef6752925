//! The continuous tracer: cycles at an interval, feeding an event stream.

use crate::cancellation::CancelToken;
use crate::net::prober::Prober;
use crate::tracer::cycle::{CycleTracer, FlowMode};
use crate::tracer::{Event, ProbeEvent};
use crate::{TraceError, TraceResult};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default capacity of the event queue between tracer and consumer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct QueueInner {
    queue: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

struct QueueShared {
    inner: Mutex<QueueInner>,
    condvar: Condvar,
}

/// Create a bounded event channel.
///
/// When the consumer stalls and the queue fills, the oldest event is
/// dropped to make room: the data is refreshable and freshness matters
/// more than completeness.
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let shared = Arc::new(QueueShared {
        inner: Mutex::new(QueueInner {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
            closed: false,
        }),
        condvar: Condvar::new(),
    });
    (
        EventSender {
            shared: Arc::clone(&shared),
        },
        EventReceiver { shared },
    )
}

/// The producing half of the event channel.
pub struct EventSender {
    shared: Arc<QueueShared>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        let mut inner = self.shared.inner.lock();
        if inner.queue.len() == inner.capacity {
            inner.queue.pop_front();
            inner.dropped += 1;
        }
        inner.queue.push_back(event);
        self.shared.condvar.notify_one();
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        self.shared.inner.lock().closed = true;
        self.shared.condvar.notify_all();
    }
}

/// The consuming half of the event channel.
pub struct EventReceiver {
    shared: Arc<QueueShared>,
}

impl EventReceiver {
    /// Block until the next event, or `None` once the sender is gone and
    /// the queue is drained.
    pub fn recv(&self) -> Option<Event> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(event) = inner.queue.pop_front() {
                return Some(event);
            }
            if inner.closed {
                return None;
            }
            self.shared.condvar.wait(&mut inner);
        }
    }

    /// As [`recv`](Self::recv) with an upper bound on the wait.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(event) = inner.queue.pop_front() {
                return Some(event);
            }
            if inner.closed {
                return None;
            }
            if self
                .shared
                .condvar
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.queue.pop_front();
            }
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.shared.inner.lock().queue.pop_front()
    }

    /// How many events have been dropped to keep the queue fresh.
    pub fn dropped(&self) -> u64 {
        self.shared.inner.lock().dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        std::iter::from_fn(move || self.recv())
    }
}

/// Loops the single-cycle tracer at a configured interval.
///
/// A fresh prober is built per cycle so the ICMP receive handle is never
/// shared across cycles.
pub struct ContinuousTracer<F> {
    make_prober: F,
    target: String,
    target_addr: IpAddr,
    max_hops: u8,
    flow_mode: FlowMode,
    interval: Duration,
    cycles: u64,
}

impl<P, F> ContinuousTracer<F>
where
    P: Prober,
    F: FnMut() -> TraceResult<P>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        make_prober: F,
        target: impl Into<String>,
        target_addr: IpAddr,
        max_hops: u8,
        flow_mode: FlowMode,
        interval: Duration,
        cycles: u64,
    ) -> Self {
        Self {
            make_prober,
            target: target.into(),
            target_addr,
            max_hops,
            flow_mode,
            interval,
            cycles,
        }
    }

    /// Run until cancelled or the configured cycle count is exhausted.
    ///
    /// All probe events of a cycle are emitted before its
    /// `CycleComplete`, which precedes anything from the next cycle;
    /// `EndOfRun` is always the final event.
    pub fn run(&mut self, cancel: &CancelToken, mut emit: impl FnMut(Event)) -> TraceResult<()> {
        let mut cycle_number = 0_u64;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let cycle_start = Instant::now();
            let prober = match (self.make_prober)() {
                Ok(prober) => prober,
                Err(e) => break Err(e),
            };
            let mut tracer = CycleTracer::new(
                prober,
                self.target.clone(),
                self.target_addr,
                self.max_hops,
                self.flow_mode,
            );
            let cycle = match tracer.run(cancel, |hop| {
                for probe in &hop.probes {
                    emit(Event::Probe(ProbeEvent::from_outcome(cycle_number, probe)));
                }
            }) {
                Ok(cycle) => cycle,
                Err(e) => break Err(e),
            };
            emit(Event::CycleComplete {
                cycle: cycle_number,
                reached: cycle.reached,
            });
            debug!(cycle = cycle_number, reached = cycle.reached, "cycle complete");
            cycle_number += 1;
            if self.cycles > 0 && cycle_number >= self.cycles {
                break Ok(());
            }
            if let Some(remaining) = self.interval.checked_sub(cycle_start.elapsed())
                && cancel.sleep(remaining)
            {
                break Ok(());
            }
        };
        emit(Event::EndOfRun);
        result
    }
}

/// A running continuous trace: its event stream and cancellation handle.
#[cfg(unix)]
pub struct TraceHandle {
    events: EventReceiver,
    cancel: CancelToken,
    join: Option<std::thread::JoinHandle<TraceResult<()>>>,
}

#[cfg(unix)]
impl TraceHandle {
    pub fn events(&self) -> &EventReceiver {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Signal cancellation; the tracer finishes the probe in flight and
    /// stops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the tracer thread to finish.
    pub fn wait(mut self) -> TraceResult<()> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| TraceError::Io(std::io::Error::other("tracer thread panicked")))?,
            None => Ok(()),
        }
    }
}

/// Resolve the target and launch a continuous trace on a background
/// thread, returning its event stream and cancellation handle.
#[cfg(unix)]
pub fn run_continuous(
    target: &str,
    config: crate::config::TraceConfig,
) -> TraceResult<TraceHandle> {
    use crate::net::SysNetwork;
    use crate::net::prober::ProtocolProber;

    let target_addr = crate::resolver::resolve_target(target, config.family)?;
    let (sender, receiver) = event_queue(DEFAULT_EVENT_CAPACITY);
    let cancel = CancelToken::new();
    let thread_cancel = cancel.clone();
    let target_name = target.to_string();
    let join = std::thread::Builder::new()
        .name("path-probe-tracer".into())
        .spawn(move || {
            let net: Arc<dyn crate::net::Network> = Arc::new(SysNetwork);
            let settings = config.prober_settings(target_addr);
            let mut tracer = ContinuousTracer::new(
                || Ok(ProtocolProber::new(Arc::clone(&net), settings.clone())),
                target_name,
                target_addr,
                config.max_hops,
                FlowMode::from_config(&config),
                config.interval,
                config.cycles,
            );
            tracer.run(&thread_cancel, |event| sender.send(event))
        })
        .map_err(TraceError::Io)?;
    Ok(TraceHandle {
        events: receiver,
        cancel,
        join: Some(join),
    })
}
