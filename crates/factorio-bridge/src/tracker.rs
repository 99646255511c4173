//! Tickets for operations that finish over later ticks
//!
//! The acknowledgment of a `move`, `mine` or `craft` only means the server
//! accepted it. A ticket pairs such an operation with a completion
//! predicate over observed state; every new observation for the server is
//! checked against the pending tickets. Player and inventory state only
//! counts for the agent it was observed for; entity scans describe the
//! world and count for every agent on the server.
//!
//! Callers hold a [`TicketHandle`] and either poll it or await resolution.
//! A ticket nobody observes is still timed out at its deadline.

use agent_bridge_core::{AgentId, ObservedState, Operation, ServerId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Completion condition over (operation, latest observed state)
pub type Predicate = Arc<dyn Fn(&Operation, &ObservedState) -> bool + Send + Sync>;

/// Ready-made completion predicates
pub mod completion {
    use super::Predicate;
    use agent_bridge_core::{MineTarget, ObservedState, Operation, Position};
    use std::sync::Arc;

    /// Distance under which a scanned entity counts as the mined one
    const MINE_EPSILON: f64 = 0.5;

    /// The mining target is absent from a scan that covers it
    pub fn target_gone() -> Predicate {
        Arc::new(|operation: &Operation, state: &ObservedState| {
            let (Operation::Mine { target }, Some(scan)) = (operation, &state.nearby) else {
                return false;
            };
            match target {
                MineTarget::Position { x, y } => {
                    let position = Position::new(*x, *y);
                    scan.covers(&position) && !scan.any_near(&position, MINE_EPSILON)
                }
                MineTarget::Entity { entity_ref } => !scan.contains_ref(*entity_ref),
            }
        })
    }

    /// The handcrafting queue has been observed empty
    pub fn crafting_done() -> Predicate {
        Arc::new(|_: &Operation, state: &ObservedState| {
            state
                .player
                .as_ref()
                .is_some_and(|player| player.crafting_queue_size == Some(0))
        })
    }

    /// The character stands within `epsilon` of `target`
    pub fn position_within(target: Position, epsilon: f64) -> Predicate {
        Arc::new(move |_: &Operation, state: &ObservedState| {
            state
                .player
                .as_ref()
                .is_some_and(|player| player.position.distance(&target) <= epsilon)
        })
    }

    /// Predicate used when the bridge registers a ticket on its own
    pub fn default_for(operation: &Operation) -> Option<Predicate> {
        match operation {
            Operation::Mine { .. } => Some(target_gone()),
            Operation::Craft { .. } => Some(crafting_done()),
            _ => None,
        }
    }
}

/// Ticket identifier, unique per tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

/// Ticket outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    Completed,
    /// The deadline passed; the effect may still be playing out server-side
    TimedOut,
    Failed(String),
    Cancelled,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TicketStatus::Pending)
    }
}

/// A ticket leaving the tracker
#[derive(Debug, Clone)]
pub struct ResolvedTicket {
    pub id: TicketId,
    pub server: ServerId,
    pub agent: AgentId,
    pub operation: Operation,
    pub status: TicketStatus,
    /// Tick of the observation that resolved it
    pub tick: Option<u64>,
}

/// Registration request for one multi-tick operation
pub struct OperationTicket {
    server: ServerId,
    agent: AgentId,
    operation: Operation,
    predicate: Predicate,
    timeout: Duration,
    notify: Option<mpsc::Sender<ResolvedTicket>>,
}

impl fmt::Debug for OperationTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTicket")
            .field("server", &self.server)
            .field("agent", &self.agent)
            .field("operation", &self.operation)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OperationTicket {
    pub fn new(
        server: ServerId,
        agent: impl Into<AgentId>,
        operation: Operation,
        predicate: Predicate,
        timeout: Duration,
    ) -> Self {
        Self {
            server,
            agent: agent.into(),
            operation,
            predicate,
            timeout,
            notify: None,
        }
    }

    /// Also deliver the resolution on `sender`
    pub fn notify(mut self, sender: mpsc::Sender<ResolvedTicket>) -> Self {
        self.notify = Some(sender);
        self
    }
}

/// Caller side of a registered ticket
#[derive(Debug, Clone)]
pub struct TicketHandle {
    id: TicketId,
    deadline: Instant,
    status: watch::Receiver<TicketStatus>,
}

impl TicketHandle {
    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Current status without waiting
    pub fn status(&self) -> TicketStatus {
        self.status.borrow().clone()
    }

    /// Wait for resolution, or until the deadline passes.
    pub async fn wait(&self) -> TicketStatus {
        let mut status = self.status.clone();
        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        loop {
            let current = status.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        let last = status.borrow().clone();
                        return if last.is_terminal() {
                            last
                        } else {
                            TicketStatus::Failed("tracker dropped".to_string())
                        };
                    }
                }
                _ = &mut deadline => {
                    let last = status.borrow().clone();
                    return if last.is_terminal() { last } else { TicketStatus::TimedOut };
                }
            }
        }
    }
}

struct PendingTicket {
    server: ServerId,
    agent: AgentId,
    operation: Operation,
    predicate: Predicate,
    deadline: Instant,
    status: watch::Sender<TicketStatus>,
    notify: Option<mpsc::Sender<ResolvedTicket>>,
}

impl PendingTicket {
    fn resolve(self, id: TicketId, status: TicketStatus, tick: Option<u64>) -> ResolvedTicket {
        self.status.send_replace(status.clone());
        let resolved = ResolvedTicket {
            id,
            server: self.server,
            agent: self.agent,
            operation: self.operation,
            status,
            tick,
        };

        if let Some(sender) = self.notify {
            match sender.try_send(resolved.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Resolution channel for {} full, dropping {}",
                        resolved.agent, id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("No subscriber for {} resolution of {}", resolved.agent, id);
                }
            }
        }
        resolved
    }
}

#[derive(Default)]
struct TrackerState {
    next_id: u64,
    pending: HashMap<TicketId, PendingTicket>,
}

/// Pending tickets across all servers
#[derive(Clone, Default)]
pub struct OperationTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `ticket`
    pub fn register(&self, ticket: OperationTicket) -> TicketHandle {
        let (status_tx, status_rx) = watch::channel(TicketStatus::Pending);
        let deadline = Instant::now() + ticket.timeout;

        let mut state = self.lock();
        state.next_id += 1;
        let id = TicketId(state.next_id);
        debug!(
            "Registered {} for {:?} by {} on {}",
            id,
            ticket.operation.kind(),
            ticket.agent,
            ticket.server
        );
        state.pending.insert(
            id,
            PendingTicket {
                server: ticket.server,
                agent: ticket.agent,
                operation: ticket.operation,
                predicate: ticket.predicate,
                deadline,
                status: status_tx,
                notify: ticket.notify,
            },
        );

        drop(state);
        self.schedule_expiry(id, deadline);

        TicketHandle {
            id,
            deadline,
            status: status_rx,
        }
    }

    /// Time the ticket out at its deadline even if no observation arrives.
    ///
    /// Without a runtime only `evaluate` and `expire` resolve overdue tickets.
    fn schedule_expiry(&self, id: TicketId, deadline: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state: Weak<Mutex<TrackerState>> = Arc::downgrade(&self.state);
        runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(state) = state.upgrade() {
                OperationTracker { state }.expire_ticket(id);
            }
        });
    }

    fn expire_ticket(&self, id: TicketId) {
        let now = Instant::now();
        let mut state = self.lock();
        let overdue = state
            .pending
            .get(&id)
            .is_some_and(|ticket| ticket.deadline <= now);
        if !overdue {
            return;
        }
        for ticket in resolve_all(&mut state, vec![(id, TicketStatus::TimedOut)], None) {
            info!(
                "{} ({:?}) for {} timed out",
                ticket.id,
                ticket.operation.kind(),
                ticket.agent
            );
        }
    }

    /// Check every pending ticket of `server` against a new observation
    /// made for `agent`.
    ///
    /// Tickets of other agents only see the entity scan.
    pub fn evaluate(
        &self,
        server: &ServerId,
        agent: &str,
        observed: &ObservedState,
    ) -> Vec<ResolvedTicket> {
        let now = Instant::now();
        let world = ObservedState {
            tick: observed.tick,
            nearby: observed.nearby.clone(),
            ..Default::default()
        };
        let mut state = self.lock();

        let outcomes: Vec<(TicketId, TicketStatus)> = state
            .pending
            .iter()
            .filter(|(_, ticket)| &ticket.server == server)
            .filter_map(|(id, ticket)| {
                let visible = if ticket.agent == agent { observed } else { &world };
                if ticket.deadline <= now {
                    Some((*id, TicketStatus::TimedOut))
                } else if (ticket.predicate)(&ticket.operation, visible) {
                    Some((*id, TicketStatus::Completed))
                } else {
                    None
                }
            })
            .collect();

        let resolved = resolve_all(&mut state, outcomes, observed.tick);
        for ticket in &resolved {
            info!(
                "{} ({:?}) for {} resolved {:?}",
                ticket.id,
                ticket.operation.kind(),
                ticket.agent,
                ticket.status
            );
        }
        resolved
    }

    /// Time out every ticket past its deadline, on any server
    pub fn expire(&self) -> Vec<ResolvedTicket> {
        let now = Instant::now();
        let mut state = self.lock();
        let outcomes = state
            .pending
            .iter()
            .filter(|(_, ticket)| ticket.deadline <= now)
            .map(|(id, _)| (*id, TicketStatus::TimedOut))
            .collect();
        resolve_all(&mut state, outcomes, None)
    }

    /// Fail every pending ticket of a server that became unreachable
    pub fn fail_server(&self, server: &ServerId, reason: &str) -> Vec<ResolvedTicket> {
        let mut state = self.lock();
        let outcomes: Vec<_> = state
            .pending
            .iter()
            .filter(|(_, ticket)| &ticket.server == server)
            .map(|(id, _)| (*id, TicketStatus::Failed(reason.to_string())))
            .collect();
        if !outcomes.is_empty() {
            warn!(
                "Failing {} pending ticket(s) on {}: {}",
                outcomes.len(),
                server,
                reason
            );
        }
        resolve_all(&mut state, outcomes, None)
    }

    pub fn poll(&self, handle: &TicketHandle) -> TicketStatus {
        handle.status()
    }

    /// Stop tracking a ticket. The server-side effect is not touched.
    pub fn cancel(&self, handle: &TicketHandle) -> bool {
        let removed = self.lock().pending.remove(&handle.id);
        match removed {
            Some(ticket) => {
                ticket.status.send_replace(TicketStatus::Cancelled);
                debug!("Cancelled {}", handle.id);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_for(&self, server: &ServerId) -> usize {
        self.lock()
            .pending
            .values()
            .filter(|ticket| &ticket.server == server)
            .count()
    }
}

fn resolve_all(
    state: &mut TrackerState,
    outcomes: Vec<(TicketId, TicketStatus)>,
    tick: Option<u64>,
) -> Vec<ResolvedTicket> {
    let mut resolved: Vec<ResolvedTicket> = outcomes
        .into_iter()
        .filter_map(|(id, status)| {
            state
                .pending
                .remove(&id)
                .map(|ticket| ticket.resolve(id, status, tick))
        })
        .collect();
    resolved.sort_by_key(|ticket| ticket.id);
    resolved
}
