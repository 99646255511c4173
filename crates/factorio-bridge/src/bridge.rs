//! Agent bridge wiring batcher, pool, cache and tracker together
//!
//! Data flow for one submission: the batcher packs operations into
//! batches, the submission checks one session out of the pool and sends
//! the batches over it strictly one after another, and every reassembled
//! response updates the state cache and the operation tracker before the
//! caller sees it.

use crate::batcher::{Batch, CommandBatcher};
use crate::cache::{CacheEntry, EntityKey, StateCache};
use crate::config::BridgeConfig;
use crate::pool::{ConnectionPool, PooledSession};
use crate::tracker::{
    completion, OperationTicket, OperationTracker, Predicate, ResolvedTicket, TicketHandle,
};
use crate::transport::{Connector, TcpConnector};
use agent_bridge_core::{
    AgentId, BridgeError, ErrorCode, ObservedState, OpResult, Operation, QueryScope, Response,
    Result, ServerEndpoint, ServerId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle to the bridge; cheap to clone and share between agent tasks
#[derive(Clone)]
pub struct AgentBridge {
    config: Arc<BridgeConfig>,
    batcher: CommandBatcher,
    pool: ConnectionPool,
    cache: StateCache,
    tracker: OperationTracker,
    subscribers: Arc<Mutex<HashMap<AgentId, mpsc::Sender<ResolvedTicket>>>>,
}

impl std::fmt::Debug for AgentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBridge")
            .field("pool", &self.pool)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl AgentBridge {
    /// Create a bridge that reaches servers over TCP
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(config.connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Create a bridge over a custom transport
    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            batcher: CommandBatcher::from_config(&config),
            pool: ConnectionPool::new(config.clone(), connector),
            cache: StateCache::new(),
            tracker: OperationTracker::new(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// Receive every ticket of `agent` as it resolves.
    ///
    /// Replaces any earlier subscription for the agent.
    pub fn subscribe(&self, agent: &str) -> mpsc::Receiver<ResolvedTicket> {
        let (tx, rx) = mpsc::channel(self.config.notify_capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.to_string(), tx);
        rx
    }

    fn subscriber(&self, agent: &str) -> Option<mpsc::Sender<ResolvedTicket>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .filter(|sender| !sender.is_closed())
            .cloned()
    }

    /// Track an operation with a caller-chosen completion predicate
    pub fn track(
        &self,
        server: &ServerId,
        agent: &str,
        operation: Operation,
        predicate: Predicate,
        timeout: Duration,
    ) -> TicketHandle {
        let mut ticket = OperationTicket::new(server.clone(), agent, operation, predicate, timeout);
        if let Some(sender) = self.subscriber(agent) {
            ticket = ticket.notify(sender);
        }
        self.tracker.register(ticket)
    }

    /// Pack `operations` into batches for `server` without sending anything
    pub fn submit(
        &self,
        agent: &str,
        server: &ServerEndpoint,
        operations: Vec<Operation>,
    ) -> Result<Submission> {
        let batches = self.batcher.submit(agent, operations)?;
        Ok(Submission {
            bridge: self.clone(),
            agent: agent.to_string(),
            server: server.clone(),
            queue: batches.into(),
            session: None,
        })
    }

    /// Submit and send every batch
    pub async fn execute(
        &self,
        agent: &str,
        server: &ServerEndpoint,
        operations: Vec<Operation>,
    ) -> Result<Execution> {
        self.submit(agent, server, operations)?.run().await
    }

    /// Query fresh state for `agent` and return what was observed
    pub async fn observe(
        &self,
        agent: &str,
        server: &ServerEndpoint,
        scope: QueryScope,
    ) -> Result<ObservedState> {
        let execution = self
            .execute(agent, server, vec![Operation::QueryState { scope }])
            .await?;
        if let Some(result) = execution.result(0) {
            if let Some(err) = result.error() {
                return Err(err);
            }
        }
        Ok(execution.observed_state())
    }

    /// Last cached value, if any
    pub async fn cached(&self, server: &ServerId, key: &EntityKey) -> Option<CacheEntry> {
        self.cache.get(server, key).await
    }

    /// Close all idle sessions
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Fold a successful response into the cache and tracker
    async fn absorb(
        &self,
        agent: &str,
        server: &ServerId,
        batch: &Batch,
        response: &Response,
    ) -> (Vec<(usize, TicketHandle)>, Vec<ResolvedTicket>) {
        for (i, operation) in batch.operations().iter().enumerate() {
            // Without a result the operation may still have run
            let maybe_applied = response.result(i).is_none_or(OpResult::is_success);
            if !maybe_applied {
                continue;
            }
            for kind in operation.invalidates() {
                let key = EntityKey::new(*kind, agent);
                match response.tick {
                    Some(tick) => self.cache.invalidate_through(server, &key, tick).await,
                    None => self.cache.invalidate(server, &key).await,
                };
            }
        }

        let observed = response.observed_state();
        let resolved = if observed.is_empty() {
            Vec::new()
        } else {
            self.cache.ingest(server, agent, &observed).await;
            self.tracker.evaluate(server, agent, &observed)
        };

        // Registered after evaluation: the same response cannot complete them
        let mut tickets = Vec::new();
        for (i, operation) in batch.operations().iter().enumerate() {
            let accepted = response.result(i).is_some_and(OpResult::is_success);
            if !accepted || !operation.is_multi_tick() {
                continue;
            }
            if let Some(predicate) = completion::default_for(operation) {
                let handle = self.track(
                    server,
                    agent,
                    operation.clone(),
                    predicate,
                    self.config.ticket_timeout,
                );
                tickets.push((batch.first_index() + i, handle));
            }
        }

        (tickets, resolved)
    }

    /// Fail tickets of a server the pool gave up on
    fn note_failure(&self, server: &ServerId, err: &BridgeError) {
        if err.code() == ErrorCode::ServerUnavailable && self.pool.is_unreachable(server) {
            self.tracker.fail_server(server, &err.to_string());
        }
    }
}

/// Result of one dispatched batch
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch: Batch,
    pub response: Response,
    /// Tickets registered for multi-tick operations, by submission index
    pub tickets: Vec<(usize, TicketHandle)>,
    /// Tickets this response resolved
    pub resolved: Vec<ResolvedTicket>,
}

/// Everything one submission produced
#[derive(Debug, Default)]
pub struct Execution {
    pub outcomes: Vec<BatchOutcome>,
}

impl Execution {
    pub fn responses(&self) -> impl Iterator<Item = &Response> {
        self.outcomes.iter().map(|outcome| &outcome.response)
    }

    /// Result of the operation at `index` in the submitted sequence
    pub fn result(&self, index: usize) -> Option<&OpResult> {
        self.outcomes.iter().find_map(|outcome| {
            let first = outcome.batch.first_index();
            if index >= first && index < first + outcome.batch.len() {
                outcome.response.result(index - first)
            } else {
                None
            }
        })
    }

    /// Failed operations as (submission index, code, message)
    pub fn failures(&self) -> Vec<(usize, ErrorCode, String)> {
        self.outcomes
            .iter()
            .flat_map(|outcome| {
                let first = outcome.batch.first_index();
                outcome
                    .response
                    .failures()
                    .map(move |(i, code, message)| (first + i, code, message.to_string()))
            })
            .collect()
    }

    pub fn tickets(&self) -> impl Iterator<Item = &(usize, TicketHandle)> {
        self.outcomes.iter().flat_map(|outcome| outcome.tickets.iter())
    }

    /// Ticket registered for the operation at `index`
    pub fn ticket(&self, index: usize) -> Option<&TicketHandle> {
        self.tickets()
            .find(|(i, _)| *i == index)
            .map(|(_, handle)| handle)
    }

    pub fn resolved(&self) -> impl Iterator<Item = &ResolvedTicket> {
        self.outcomes.iter().flat_map(|outcome| outcome.resolved.iter())
    }

    /// State observed across all responses, later ones winning
    pub fn observed_state(&self) -> ObservedState {
        let mut state = ObservedState::default();
        for response in self.responses() {
            state.merge(response.observed_state());
        }
        state
    }
}

/// Batches of one submission waiting to be sent.
///
/// Batches go out in order over a single pooled session, each only after
/// the previous response is complete. Dropping or cancelling the
/// submission discards unsent batches; a sent batch is never resent.
pub struct Submission {
    bridge: AgentBridge,
    agent: AgentId,
    server: ServerEndpoint,
    queue: VecDeque<Batch>,
    session: Option<PooledSession>,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("agent", &self.agent)
            .field("server", &self.server.id)
            .field("pending", &self.queue.len())
            .field("session", &self.session)
            .finish()
    }
}

impl Submission {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn server(&self) -> &ServerId {
        &self.server.id
    }

    /// Batches not yet sent
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_batches(&self) -> impl Iterator<Item = &Batch> {
        self.queue.iter()
    }

    /// Drop unsent batches and return the session; returns how many were dropped
    pub fn cancel(mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            info!(
                "Agent {} cancelled {} unsent batch(es) for {}",
                self.agent, dropped, self.server.id
            );
        }
        dropped
    }

    /// Send the next batch and wait for its response.
    ///
    /// Returns `Ok(None)` once the queue is empty. A failed batch is not
    /// put back; the batches behind it stay queued.
    pub async fn dispatch_next(&mut self) -> Result<Option<BatchOutcome>> {
        if self.queue.is_empty() {
            // Nothing left to send; give the session back
            self.session = None;
            return Ok(None);
        }

        if self.session.is_none() {
            match self.bridge.pool.acquire(&self.server).await {
                Ok(session) => self.session = Some(session),
                Err(e) => {
                    self.bridge.note_failure(&self.server.id, &e);
                    return Err(e);
                }
            }
        }
        let (Some(session), Some(batch)) = (self.session.as_mut(), self.queue.pop_front()) else {
            return Ok(None);
        };
        debug!(
            "Agent {} sending {} operation(s) ({} bytes) to {}",
            self.agent,
            batch.len(),
            batch.payload_len(),
            self.server.id
        );

        let response = match session
            .exchange(batch.payload(), self.bridge.config.request_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Batch for {} on {} failed, {} batch(es) left unsent: {}",
                    self.agent,
                    self.server.id,
                    self.queue.len(),
                    e
                );
                // The failed session is discarded when the guard drops
                self.session = None;
                return Err(e);
            }
        };

        if let Some(err) = response.error() {
            warn!(
                "Batch for {} rejected by {}: {}",
                self.agent, self.server.id, err
            );
            return Err(err);
        }

        let (tickets, resolved) = self
            .bridge
            .absorb(&self.agent, &self.server.id, &batch, &response)
            .await;

        Ok(Some(BatchOutcome {
            batch,
            response,
            tickets,
            resolved,
        }))
    }

    /// Send every remaining batch.
    ///
    /// Stops at the first failure; whatever was not sent stays queued and
    /// can be inspected or cancelled.
    pub async fn run(&mut self) -> Result<Execution> {
        let mut execution = Execution::default();
        while let Some(outcome) = self.dispatch_next().await? {
            execution.outcomes.push(outcome);
        }
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcon::{packet_type, read_packet, write_packet, PacketType, RconPacket};
    use crate::transport::BoxedStream;
    use agent_bridge_core::Direction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

    /// In-memory server answering commands through `respond`; `None` drops the connection
    struct ScriptedConnector {
        respond: Responder,
        connects: AtomicUsize,
        received: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedConnector {
        fn new(respond: Responder) -> Arc<Self> {
            Arc::new(Self {
                respond,
                connects: AtomicUsize::new(0),
                received: Arc::new(Mutex::new(Vec::new())),
            })
        }

        fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _endpoint: &ServerEndpoint) -> Result<BoxedStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (client, mut server) = tokio::io::duplex(64 * 1024);
            let respond = self.respond.clone();
            let received = self.received.clone();

            tokio::spawn(async move {
                while let Ok(packet) = read_packet(&mut server).await {
                    let reply = if packet.packet_type == packet_type::AUTH {
                        RconPacket::new(packet.id, PacketType::ExecCommand, "")
                    } else {
                        let body = String::from_utf8_lossy(&packet.body).into_owned();
                        received.lock().unwrap().push(body.clone());
                        match respond(&body) {
                            Some(text) => RconPacket {
                                id: packet.id,
                                packet_type: packet_type::RESPONSE_VALUE,
                                body: text.into_bytes(),
                            },
                            None => return,
                        }
                    };
                    if write_packet(&mut server, &reply).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Box::new(client))
        }
    }

    fn ok_all() -> Responder {
        Arc::new(|_: &str| {
            Some(r#"{"status":"success","data":{"0":{"status":"success"}}}"#.to_string())
        })
    }

    fn config(ceiling: usize) -> BridgeConfig {
        BridgeConfig {
            payload_ceiling: ceiling,
            pool_size: 1,
            acquire_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint::new("s1", "memory", "pw")
    }

    fn moves(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|_| Operation::Move {
                direction: Direction::East,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_sends_nothing() {
        let connector = ScriptedConnector::new(ok_all());
        let bridge = AgentBridge::with_connector(config(3800), connector.clone()).unwrap();

        let submission = bridge.submit("agent-1", &endpoint(), moves(3)).unwrap();
        assert_eq!(submission.pending(), 1);
        assert_eq!(submission.cancel(), 1);

        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(connector.received().is_empty());
    }

    #[tokio::test]
    async fn test_batches_sent_in_order_over_one_session() {
        let connector = ScriptedConnector::new(ok_all());
        let bridge = AgentBridge::with_connector(config(300), connector.clone()).unwrap();

        let mut submission = bridge.submit("agent-1", &endpoint(), moves(12)).unwrap();
        let batches: Vec<String> = submission
            .pending_batches()
            .map(|batch| batch.payload().to_string())
            .collect();
        assert!(batches.len() > 1);

        let execution = submission.run().await.unwrap();
        assert_eq!(execution.outcomes.len(), batches.len());
        assert_eq!(connector.received(), batches);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(submission.pending(), 0);

        // Session went back to the pool
        let stats = bridge.pool().stats(&endpoint().id).unwrap();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_batch_error_stops_submission() {
        let connector = ScriptedConnector::new(Arc::new(|_: &str| {
            Some(r#"{"status":"error","code":"NotFound","message":"no character"}"#.to_string())
        }));
        let bridge = AgentBridge::with_connector(config(300), connector.clone()).unwrap();

        let mut submission = bridge.submit("agent-1", &endpoint(), moves(12)).unwrap();
        let total = submission.pending();
        let err = submission.run().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(submission.pending(), total - 1);
        assert_eq!(connector.received().len(), 1);
        assert_eq!(submission.cancel(), total - 1);
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_unsent_batches() {
        let connector = ScriptedConnector::new(Arc::new(|_: &str| None));
        let bridge = AgentBridge::with_connector(config(300), connector.clone()).unwrap();

        let mut submission = bridge.submit("agent-1", &endpoint(), moves(12)).unwrap();
        let total = submission.pending();
        let err = submission.dispatch_next().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(submission.pending(), total - 1);

        // The broken session is gone; the next batch gets a fresh one
        assert_eq!(bridge.pool().stats(&endpoint().id).unwrap().idle, 0);
        let _ = submission.dispatch_next().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_responses_update_cache_and_register_tickets() {
        let connector = ScriptedConnector::new(Arc::new(|body: &str| {
            if body.contains("query_state") {
                Some(
                    r#"{"status":"success","tick":50,"data":{"0":{"status":"success","player":{"position":{"x":1.0,"y":1.0},"crafting_queue_size":0}}}}"#
                        .to_string(),
                )
            } else {
                Some(
                    r#"{"status":"success","tick":40,"data":{"0":{"status":"success"},"1":{"status":"error","code":"InsufficientResources","message":"no plates"}}}"#
                        .to_string(),
                )
            }
        }));
        let bridge = AgentBridge::with_connector(config(3800), connector).unwrap();
        let mut resolutions = bridge.subscribe("agent-1");
        let server = endpoint();

        let execution = bridge
            .execute(
                "agent-1",
                &server,
                vec![
                    Operation::Craft {
                        recipe: "iron-gear-wheel".to_string(),
                        count: 2,
                    },
                    Operation::Craft {
                        recipe: "pipe".to_string(),
                        count: 1,
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            execution.failures(),
            vec![(1, ErrorCode::InsufficientResources, "no plates".to_string())]
        );
        // Only the accepted craft is tracked
        let ticket = execution.ticket(0).unwrap().clone();
        assert!(execution.ticket(1).is_none());

        let state = bridge
            .observe("agent-1", &server, QueryScope::Player)
            .await
            .unwrap();
        assert_eq!(state.tick, Some(50));

        assert_eq!(ticket.wait().await, crate::tracker::TicketStatus::Completed);
        let delivered = resolutions.recv().await.unwrap();
        assert_eq!(delivered.id, ticket.id());

        let cached = bridge
            .cached(&server.id, &EntityKey::player("agent-1"))
            .await
            .unwrap();
        assert_eq!(cached.observed_tick(), 50);
    }

    #[tokio::test]
    async fn test_late_response_does_not_replace_newer_state() {
        let connector = ScriptedConnector::new(Arc::new(|body: &str| {
            let reply = if body.contains("query_state") {
                r#"{"status":"success","tick":200,"data":{"0":{"status":"success","player":{"position":{"x":20.0,"y":0.0}}}}}"#
            } else {
                // Produced before the query but delivered after it
                r#"{"status":"success","tick":150,"data":{"0":{"status":"success","player":{"position":{"x":15.0,"y":0.0}}}}}"#
            };
            Some(reply.to_string())
        }));
        let bridge = AgentBridge::with_connector(config(3800), connector).unwrap();
        let server = endpoint();

        bridge
            .observe("agent-1", &server, QueryScope::Player)
            .await
            .unwrap();
        bridge
            .execute(
                "agent-1",
                &server,
                vec![Operation::Teleport { x: 15.0, y: 0.0 }],
            )
            .await
            .unwrap();

        let cached = bridge
            .cached(&server.id, &EntityKey::player("agent-1"))
            .await
            .unwrap();
        assert_eq!(cached.observed_tick(), 200);
        assert_eq!(
            cached.value().position(),
            Some(agent_bridge_core::Position::new(20.0, 0.0))
        );
    }
}
