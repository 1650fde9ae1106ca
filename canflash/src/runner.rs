//! Single-threaded control loop around the [`Engine`].
//!
//! The runner owns the input queue. Transport threads push into it through
//! [`InputSender`] clones; the runner pops one input at a time, feeds it to
//! the engine and turns the engine's armed deadline into
//! [`Input::TimerExpired`] when nothing arrives in time.

use {
    crate::{
        engine::{Engine, UpgradeConfig},
        error::Result,
        event::{Event, Input, InputSender, Request},
        is_interrupted_requested,
        transport::Transport,
    },
    log::{debug, warn},
    std::{
        sync::mpsc::{Receiver, RecvTimeoutError},
        time::{Duration, Instant},
    },
};

/// How often a blocked runner checks the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

/// Engine plus its input queue.
pub struct Runner<T: Transport> {
    engine: Engine<T>,
    queue: Receiver<Input>,
    sender: InputSender,
}

impl<T: Transport> Runner<T> {
    /// Create a runner and its engine.
    pub fn new(transport: T, config: UpgradeConfig) -> Result<Self> {
        let (sender, queue) = InputSender::channel();
        let engine = Engine::new(transport, sender.clone(), config)?;
        Ok(Self {
            engine,
            queue,
            sender,
        })
    }

    /// A handle for pushing inputs from other threads.
    pub fn sender(&self) -> InputSender {
        self.sender.clone()
    }

    /// Borrow the engine.
    pub fn engine(&self) -> &Engine<T> {
        &self.engine
    }

    /// Mutably borrow the engine.
    pub fn engine_mut(&mut self) -> &mut Engine<T> {
        &mut self.engine
    }

    /// Consume the runner, returning the engine.
    pub fn into_engine(self) -> Engine<T> {
        self.engine
    }

    /// Process at most one input, waiting up to `wait`.
    ///
    /// An armed timer that expires during the wait is delivered as
    /// [`Input::TimerExpired`]. An already expired timer goes ahead of
    /// queued inputs, so a busy bus cannot starve it. Returns whether
    /// anything was processed.
    pub fn turn(&mut self, wait: Duration) -> bool {
        let now = Instant::now();
        let armed = self
            .engine
            .armed_timer()
            .copied();
        if let Some(timer) = armed.filter(|t| now >= t.deadline) {
            self.engine
                .handle(Input::TimerExpired(timer.token));
            return true;
        }
        let wait = armed.map_or(wait, |t| wait.min(t.deadline.saturating_duration_since(now)));

        match self.queue.recv_timeout(wait) {
            Ok(input) => {
                self.engine.handle(input);
                true
            },
            Err(RecvTimeoutError::Timeout) => match armed {
                Some(timer) if Instant::now() >= timer.deadline => {
                    self.engine
                        .handle(Input::TimerExpired(timer.token));
                    true
                },
                _ => false,
            },
            // The runner holds a sender, so the queue never disconnects.
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run `request` until its terminal event, passing every event to
    /// `on_event` as it is emitted.
    ///
    /// If the embedding application requests an interrupt while the
    /// operation is pending, the link is disconnected, which cancels it.
    pub fn execute<F>(&mut self, request: Request, mut on_event: F) -> Event
    where
        F: FnMut(&Event),
    {
        let operation = request.operation();
        debug!("Executing {operation}");
        self.engine
            .handle(Input::Request(request));

        let mut interrupted = false;
        loop {
            while let Some(event) = self.engine.poll_event() {
                on_event(&event);
                if event.terminal_operation() == Some(operation) {
                    return event;
                }
            }

            if !interrupted && is_interrupted_requested() {
                warn!("Interrupted, cancelling {operation}");
                interrupted = true;
                self.engine.disconnect();
                continue;
            }
            self.turn(INTERRUPT_POLL);
        }
    }
}
