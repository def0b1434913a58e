//! Orchestrated pipeline runs
//!
//! The [`Orchestrator`] discovers the chain hanging off the root components,
//! enables it, attaches handlers to the open ports, starts capture and waits
//! until every awaited port has completed. Teardown always runs to the end,
//! whatever the outcome.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Select;
use tracing::{debug, error, info, warn};

use super::callback::{CompletionPolicy, PortCallback, SharedCapture, SharedFeed};
use super::component::Component;
use super::connection::Connection;
use super::context::Context;
use super::errors::{PipelineError, PortDisableError};
use super::graph::PipelineGraph;
use super::lock;
use super::port::Port;
use super::trigger::{CancellationToken, Completion, Trigger};
use super::watchdog::OperationGuard;
use crate::handlers::{CaptureHandler, FeedHandler};

struct CaptureAttachment {
    port: Port,
    handler: SharedCapture,
    policy: CompletionPolicy,
}

struct FeedAttachment {
    port: Port,
    handler: SharedFeed,
}

/// Everything one run switched on, in order
#[derive(Default)]
struct Session {
    components: Vec<Component>,
    connections: Vec<Connection>,
    ports: Vec<Port>,
    awaited: Vec<(String, Trigger)>,
    handlers: Vec<(String, SharedCapture)>,
    capturing: Vec<Component>,
}

impl Session {
    fn pending(&self) -> Vec<String> {
        self.awaited
            .iter()
            .filter(|(_, trigger)| !trigger.is_fired())
            .map(|(label, _)| label.clone())
            .collect()
    }
}

enum Waited {
    Completed,
    Cancelled,
    TimedOut { pending: Vec<String>, cancelled: bool },
}

/// Runs a component chain to completion
pub struct Orchestrator {
    context: Context,
    captures: Vec<CaptureAttachment>,
    feeds: Vec<FeedAttachment>,
}

impl Orchestrator {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            captures: Vec::new(),
            feeds: Vec::new(),
        }
    }

    /// Consume the output of `port` with `handler`, completing on the first terminal buffer
    pub fn attach_capture(
        &mut self,
        port: &Port,
        handler: impl CaptureHandler + 'static,
    ) -> Result<(), PipelineError> {
        self.attach_capture_with_policy(port, handler, CompletionPolicy::default())
    }

    pub fn attach_capture_with_policy(
        &mut self,
        port: &Port,
        handler: impl CaptureHandler + 'static,
        policy: CompletionPolicy,
    ) -> Result<(), PipelineError> {
        let handler: SharedCapture = Arc::new(std::sync::Mutex::new(handler));
        self.attach_shared_capture(port, handler, policy)
    }

    /// Attach a handler the caller keeps a reference to; one handler may serve several ports
    pub fn attach_shared_capture(
        &mut self,
        port: &Port,
        handler: SharedCapture,
        policy: CompletionPolicy,
    ) -> Result<(), PipelineError> {
        let callback = PortCallback::shared_capture(handler.clone(), policy);
        if !callback.accepts(port.kind()) {
            return Err(PipelineError::HandlerMismatch {
                port: port.label().to_string(),
            });
        }
        self.detach(port);
        self.captures.push(CaptureAttachment {
            port: port.clone(),
            handler,
            policy,
        });
        Ok(())
    }

    /// Feed input `port` from `handler`
    pub fn attach_feed(
        &mut self,
        port: &Port,
        handler: impl FeedHandler + 'static,
    ) -> Result<(), PipelineError> {
        let handler: SharedFeed = Arc::new(std::sync::Mutex::new(handler));
        self.attach_shared_feed(port, handler)
    }

    pub fn attach_shared_feed(&mut self, port: &Port, handler: SharedFeed) -> Result<(), PipelineError> {
        let callback = PortCallback::shared_feed(handler.clone());
        if !callback.accepts(port.kind()) {
            return Err(PipelineError::HandlerMismatch {
                port: port.label().to_string(),
            });
        }
        self.detach(port);
        self.feeds.push(FeedAttachment {
            port: port.clone(),
            handler,
        });
        Ok(())
    }

    /// Remove whatever handler is attached to `port`
    pub fn detach(&mut self, port: &Port) -> bool {
        let before = self.captures.len() + self.feeds.len();
        self.captures.retain(|a| !a.port.same_as(port));
        self.feeds.retain(|a| !a.port.same_as(port));
        before != self.captures.len() + self.feeds.len()
    }

    /// Run the chain below `root` until every awaited port completes or `cancellation` fires
    pub fn run(&self, root: &Component, cancellation: CancellationToken) -> Result<(), PipelineError> {
        self.run_all(std::slice::from_ref(root), cancellation)
    }

    /// Run the chains below several roots as one pipeline
    pub fn run_all(
        &self,
        roots: &[Component],
        cancellation: CancellationToken,
    ) -> Result<(), PipelineError> {
        if roots.is_empty() {
            return Err(PipelineError::NoRoots);
        }
        let _monitor = self.context.watchdog().start_monitoring_thread();
        let graph = PipelineGraph::discover(roots);
        info!(
            "Starting pipeline: {} components, {} connections, {} open outputs, {} open inputs",
            graph.components().len(),
            graph.connections().len(),
            graph.open_outputs().len(),
            graph.open_inputs().len()
        );

        let mut session = Session::default();
        if let Err(e) = self.setup(&graph, roots, &mut session) {
            error!("Pipeline setup failed: {}", e);
            self.stop_capture(&session);
            self.disable_ports(&session);
            self.disable_chain(&session);
            return Err(e);
        }

        let waited = self.await_completion(&graph, &session, &cancellation);
        self.stop_capture(&session);

        let mut teardown = self.disable_ports(&session);
        let mut failures: Vec<(String, String)> = Vec::new();
        for (label, trigger) in &session.awaited {
            match trigger.outcome() {
                Some(Completion::Failed(reason)) => failures.push((label.clone(), reason)),
                outcome => debug!("[{}] Outcome: {:?}", label, outcome),
            }
        }
        failures.extend(self.post_process(&session));
        teardown.extend(self.disable_chain(&session));

        match waited {
            Waited::TimedOut {
                pending,
                cancelled: false,
            } => {
                warn!("Pipeline timed out waiting for {:?}", pending);
                return Err(PipelineError::Timeout { pending });
            }
            Waited::TimedOut {
                pending,
                cancelled: true,
            } => warn!("Cancellation grace expired; {:?} never completed", pending),
            Waited::Cancelled => info!("Pipeline cancelled"),
            Waited::Completed => {}
        }
        if !failures.is_empty() {
            return Err(PipelineError::StreamFailed { failures });
        }
        if let Some(e) = teardown.into_iter().next() {
            return Err(e);
        }
        info!("Pipeline finished");
        Ok(())
    }

    fn setup(
        &self,
        graph: &PipelineGraph,
        roots: &[Component],
        session: &mut Session,
    ) -> Result<(), PipelineError> {
        for component in graph.components() {
            component.enable()?;
            session.components.push(component.clone());
        }
        for connection in graph.connections() {
            connection.enable()?;
            session.connections.push(connection.clone());
        }

        for attachment in &self.captures {
            let port = &attachment.port;
            if !graph.contains(port) {
                warn!("[{}] Not reachable from the roots; handler ignored", port.label());
                continue;
            }
            port.enable(PortCallback::shared_capture(
                attachment.handler.clone(),
                attachment.policy,
            ))?;
            session.ports.push(port.clone());
            session
                .handlers
                .push((port.label().to_string(), attachment.handler.clone()));
            if let Some(trigger) = port.trigger() {
                session.awaited.push((port.label().to_string(), trigger));
            }
        }
        for port in graph.open_outputs() {
            if !self.captures.iter().any(|a| a.port.same_as(port)) {
                debug!("[{}] No handler attached; left disabled", port.label());
            }
        }

        for attachment in &self.feeds {
            let port = &attachment.port;
            if !graph.contains(port) {
                warn!("[{}] Not reachable from the roots; feed ignored", port.label());
                continue;
            }
            port.enable(PortCallback::shared_feed(attachment.handler.clone()))?;
            session.ports.push(port.clone());
            if let Some(trigger) = port.trigger() {
                session.awaited.push((port.label().to_string(), trigger));
            }
        }

        if session.awaited.is_empty() {
            return Err(PipelineError::NothingToAwait {
                roots: roots.iter().map(|root| root.name().to_string()).collect(),
            });
        }

        for root in roots {
            root.start_capture()
                .map_err(|source| PipelineError::Capture {
                    component: root.name().to_string(),
                    source,
                })?;
            session.capturing.push(root.clone());
        }
        Ok(())
    }

    /// Block until every awaited trigger fired, the deadline passed, or the
    /// cancellation grace ran out
    fn await_completion(
        &self,
        graph: &PipelineGraph,
        session: &Session,
        cancellation: &CancellationToken,
    ) -> Waited {
        let config = self.context.config();
        let handle = self.context.watchdog().register(
            "orchestrator",
            "await",
            &format!("{} ports", session.awaited.len()),
        );
        let _guard = OperationGuard::new(&handle);

        let mut deadline = config.completion_deadline.map(|limit| Instant::now() + limit);
        let mut cancelled = false;
        loop {
            let pending: Vec<&Trigger> = session
                .awaited
                .iter()
                .map(|(_, trigger)| trigger)
                .filter(|trigger| !trigger.is_fired())
                .collect();
            if pending.is_empty() {
                return if cancelled {
                    Waited::Cancelled
                } else {
                    Waited::Completed
                };
            }

            if !cancelled && cancellation.is_cancelled() {
                cancelled = true;
                info!(
                    "Cancellation requested; force-stopping {} components",
                    graph.components().len()
                );
                for component in graph.components() {
                    component.force_stop();
                }
                let grace = Instant::now() + config.cancel_grace;
                deadline = Some(deadline.map_or(grace, |d| d.min(grace)));
                continue;
            }

            let mut select = Select::new();
            for trigger in &pending {
                select.recv(trigger.receiver());
            }
            if !cancelled {
                select.recv(cancellation.receiver());
            }
            let ready = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    select.ready_timeout(remaining).is_ok()
                }
                None => {
                    select.ready();
                    true
                }
            };
            if !ready {
                return Waited::TimedOut {
                    pending: session.pending(),
                    cancelled,
                };
            }
        }
    }

    fn stop_capture(&self, session: &Session) {
        for root in session.capturing.iter().rev() {
            if let Err(e) = root.stop_capture() {
                warn!("[{}] Stopping capture failed: {}", root.name(), e);
            }
        }
    }

    /// Disable every port this run enabled and free its pool
    fn disable_ports(&self, session: &Session) -> Vec<PipelineError> {
        let mut errors = Vec::new();
        for port in session.ports.iter().rev() {
            if port.is_enabled()
                && let Err(e) = port.disable()
            {
                warn!("[{}] {}", port.label(), e);
                errors.push(e.into());
            }
            match port.destroy_pool() {
                Ok(()) => {}
                Err(PortDisableError::Outstanding { outstanding, .. }) => {
                    warn!(
                        "[{}] {} buffers never came back; abandoning pool",
                        port.label(),
                        outstanding
                    );
                    port.abandon_pool();
                }
                Err(e) => {
                    warn!("[{}] {}", port.label(), e);
                    errors.push(e.into());
                }
            }
        }
        errors
    }

    /// Disable connections, then components, in reverse order of enabling
    fn disable_chain(&self, session: &Session) -> Vec<PipelineError> {
        let mut errors = Vec::new();
        for connection in session.connections.iter().rev() {
            if let Err(e) = connection.disable() {
                warn!("[{}] {}", connection.label(), e);
                errors.push(e.into());
            }
        }
        for component in session.components.iter().rev() {
            if let Err(e) = component.disable() {
                warn!("[{}] {}", component.name(), e);
                errors.push(e.into());
            }
        }
        errors
    }

    /// Call `post_process` once per distinct capture handler
    fn post_process(&self, session: &Session) -> Vec<(String, String)> {
        let mut done: Vec<&SharedCapture> = Vec::new();
        let mut failures = Vec::new();
        for (label, handler) in &session.handlers {
            if done.iter().any(|seen| Arc::ptr_eq(seen, handler)) {
                continue;
            }
            done.push(handler);
            if let Err(e) = lock(handler).post_process() {
                error!("[{}] Post-processing failed: {}", label, e);
                failures.push((label.clone(), e.to_string()));
            }
        }
        failures
    }
}
