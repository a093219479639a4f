// src/gcode/executor.rs - Per-actor command queues with completion signalling
//
// Every actor that submits commands (the main queue, a macro, the print
// streamer) owns an ExecutorContext. A context has at most one command in
// flight; firmware responses are routed to the deepest live context.
use crate::gcode::parser::strip_comment;
use std::collections::VecDeque;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{Notify, oneshot};

pub const MAX_CONTEXT_DEPTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Executor context '{0}' is closed")]
    Closed(String),
    #[error("Executor context '{0}' already has an active sub-context")]
    SubContextBusy(String),
    #[error("Macro nesting exceeds {0} levels")]
    NestingTooDeep(usize),
}

/// Receives commands leaving a context.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, context: &Arc<ExecutorContext>, line: &str);

    /// Called once per line for non-silent submissions.
    fn record(&self, _line: &str) {}
}

struct Command {
    line: String,
    response: Vec<String>,
    done: oneshot::Sender<String>,
}

#[derive(Default)]
struct ContextState {
    queue: VecDeque<Command>,
    in_flight: Option<Command>,
    sub_context: Option<Arc<ExecutorContext>>,
    closed: bool,
}

/// Completion handle for one submission; resolves to the responses of all its
/// lines joined by newlines.
pub struct PendingResponse {
    context: String,
    receivers: Vec<oneshot::Receiver<String>>,
}

impl PendingResponse {
    pub async fn wait(self) -> Result<String, ExecutorError> {
        let PendingResponse { context, receivers } = self;
        let mut responses = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let response = receiver.await.map_err(|_| ExecutorError::Closed(context.clone()))?;
            responses.push(response);
        }
        Ok(responses.join("\n"))
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

impl IntoFuture for PendingResponse {
    type Output = Result<String, ExecutorError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

pub struct ExecutorContext {
    name: String,
    depth: usize,
    dispatcher: Weak<dyn Dispatch>,
    state: Mutex<ContextState>,
    command_finished: Notify,
}

impl std::fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish()
    }
}

impl ExecutorContext {
    pub fn new(name: impl Into<String>, dispatcher: Weak<dyn Dispatch>) -> Arc<Self> {
        Arc::new(Self::with_depth(name.into(), dispatcher, 0))
    }

    fn with_depth(name: String, dispatcher: Weak<dyn Dispatch>, depth: usize) -> Self {
        Self {
            name,
            depth,
            dispatcher,
            state: Mutex::new(ContextState::default()),
            command_finished: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues one or more newline-separated lines. Comments and blank lines are
    /// dropped; `None` means nothing was left to send. Important lines jump
    /// ahead of everything already waiting, keeping their own order.
    pub fn queue_gcode(self: &Arc<Self>, text: &str, important: bool, silent: bool) -> Option<PendingResponse> {
        let lines: Vec<&str> = text.split('\n').map(strip_comment).filter(|l| !l.is_empty()).collect();
        if lines.is_empty() {
            return None;
        }

        if !silent {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                for line in &lines {
                    dispatcher.record(line);
                }
            }
        }

        let mut receivers = Vec::with_capacity(lines.len());
        let mut commands = Vec::with_capacity(lines.len());
        for line in lines {
            let (done, receiver) = oneshot::channel();
            commands.push(Command { line: line.to_string(), response: Vec::new(), done });
            receivers.push(receiver);
        }

        let rejected = {
            let mut state = self.lock();
            if state.closed {
                Some(commands)
            } else {
                if important {
                    for command in commands.into_iter().rev() {
                        state.queue.push_front(command);
                    }
                } else {
                    state.queue.extend(commands);
                }
                None
            }
        };
        if rejected.is_some() {
            tracing::debug!("Context {} is closed, dropping submission", self.name);
        }
        drop(rejected);

        self.flush();
        Some(PendingResponse { context: self.name.clone(), receivers })
    }

    /// Sends the next queued command if nothing is in flight.
    fn flush(self: &Arc<Self>) {
        let line = {
            let mut state = self.lock();
            if state.closed || state.in_flight.is_some() {
                return;
            }
            let Some(command) = state.queue.pop_front() else { return };
            let line = command.line.clone();
            state.in_flight = Some(command);
            line
        };

        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.dispatch(self, &line),
            None => {
                tracing::warn!("No dispatcher for context {}, closing", self.name);
                self.close();
            }
        }
    }

    /// Appends a line to the in-flight command's response.
    pub fn respond(&self, line: &str) -> bool {
        let mut state = self.lock();
        match state.in_flight.as_mut() {
            Some(command) => {
                command.response.push(line.to_string());
                true
            }
            None => false,
        }
    }

    /// Finishes the in-flight command and sends the next one.
    pub fn complete(self: &Arc<Self>, final_line: Option<&str>) {
        let finished = {
            let mut state = self.lock();
            state.in_flight.take()
        };
        let Some(mut command) = finished else {
            tracing::debug!("Completion on idle context {}", self.name);
            return;
        };
        if let Some(line) = final_line {
            command.response.push(line.to_string());
        }
        // The submitter may have stopped waiting; that is fine.
        let _ = command.done.send(command.response.join("\n"));
        self.command_finished.notify_waiters();
        self.flush();
    }

    pub fn in_flight(&self) -> Option<String> {
        self.lock().in_flight.as_ref().map(|command| command.line.clone())
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.in_flight.is_none() && state.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// The innermost live context, which owns the firmware's next response.
    pub fn deepest(self: &Arc<Self>) -> Arc<ExecutorContext> {
        let mut current = self.clone();
        loop {
            let next = current.lock().sub_context.clone();
            match next {
                Some(sub) => current = sub,
                None => return current,
            }
        }
    }

    pub fn spawn_sub_context(self: &Arc<Self>, name: &str) -> Result<Arc<ExecutorContext>, ExecutorError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ExecutorError::Closed(self.name.clone()));
        }
        if state.sub_context.is_some() {
            return Err(ExecutorError::SubContextBusy(self.name.clone()));
        }
        if self.depth + 1 > MAX_CONTEXT_DEPTH {
            return Err(ExecutorError::NestingTooDeep(MAX_CONTEXT_DEPTH));
        }
        let sub = Arc::new(Self::with_depth(
            format!("{}/{}", self.name, name),
            self.dispatcher.clone(),
            self.depth + 1,
        ));
        state.sub_context = Some(sub.clone());
        Ok(sub)
    }

    pub fn release_sub_context(&self) {
        let sub = self.lock().sub_context.take();
        if let Some(sub) = sub {
            sub.close();
        }
    }

    /// Rejects further submissions and fails everything pending.
    pub fn close(&self) {
        let (queued, in_flight, sub) = {
            let mut state = self.lock();
            state.closed = true;
            let queued: Vec<Command> = state.queue.drain(..).collect();
            (queued, state.in_flight.take(), state.sub_context.take())
        };
        drop(queued);
        drop(in_flight);
        if let Some(sub) = sub {
            sub.close();
        }
        self.command_finished.notify_waiters();
    }

    /// Resolves once nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.command_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
