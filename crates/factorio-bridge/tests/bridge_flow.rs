//! End-to-end data flow against a fake Factorio RCON server on localhost

use agent_bridge_core::{ErrorCode, Operation, QueryScope, ServerEndpoint};
use factorio_bridge::rcon::{packet_type, read_packet, write_packet, RconPacket};
use factorio_bridge::{AgentBridge, BridgeConfig, EntityKey, TicketStatus};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const PASSWORD: &str = "factorio";

struct Ore {
    x: f64,
    y: f64,
    unit_number: u64,
    /// Queries left before a mined ore disappears
    mining: Option<u32>,
}

/// Minimal stand-in for a server running the agent bridge mod
struct FakeFactorio {
    tick: AtomicU64,
    ores: Mutex<Vec<Ore>>,
    crash_next: AtomicBool,
    auths: AtomicUsize,
    /// Bytes per response packet
    chunk: usize,
}

impl FakeFactorio {
    fn new(ores: &[(f64, f64)], chunk: usize) -> Arc<Self> {
        Arc::new(Self {
            tick: AtomicU64::new(1000),
            ores: Mutex::new(
                ores.iter()
                    .enumerate()
                    .map(|(i, (x, y))| Ore {
                        x: *x,
                        y: *y,
                        unit_number: i as u64 + 1,
                        mining: None,
                    })
                    .collect(),
            ),
            crash_next: AtomicBool::new(false),
            auths: AtomicUsize::new(0),
            chunk,
        })
    }

    async fn start(self: &Arc<Self>) -> ServerEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let world = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, world.clone()));
            }
        });
        ServerEndpoint::new("fake", address, PASSWORD)
    }

    fn execute(&self, body: &str) -> String {
        let start = body.find("\"[").unwrap() + 1;
        let end = body.rfind("]\")))").unwrap() + 1;
        let ops: Vec<Value> = serde_json::from_str(&lua_unescape(&body[start..end])).unwrap();
        let tick = self.tick.fetch_add(60, Ordering::SeqCst) + 60;

        let mut data = Map::new();
        for (i, op) in ops.iter().enumerate() {
            let result = match op["op"].as_str().unwrap() {
                "mine" => self.mine(op),
                "query_state" => self.query(op),
                _ => json!({"status": "success"}),
            };
            data.insert(i.to_string(), result);
        }
        json!({"status": "success", "tick": tick, "data": data}).to_string()
    }

    fn mine(&self, op: &Value) -> Value {
        let (x, y) = (op["x"].as_f64().unwrap(), op["y"].as_f64().unwrap());
        let mut ores = self.ores.lock().unwrap();
        match ores
            .iter_mut()
            .find(|ore| (ore.x - x).abs() < 0.5 && (ore.y - y).abs() < 0.5)
        {
            Some(ore) => {
                ore.mining = Some(1);
                json!({"status": "success"})
            }
            None => json!({"status": "error", "code": "NotFound", "message": "nothing to mine"}),
        }
    }

    fn query(&self, op: &Value) -> Value {
        let mut ores = self.ores.lock().unwrap();
        ores.retain(|ore| ore.mining != Some(0));

        let mut result = json!({
            "status": "success",
            "player": {"position": {"x": 0.0, "y": 0.0}, "crafting_queue_size": 0}
        });
        if let Some(radius) = op["scope"]["nearby"]["radius"]
            .as_f64()
            .or_else(|| op["scope"]["all"]["radius"].as_f64())
        {
            let entities: Vec<Value> = ores
                .iter()
                .map(|ore| {
                    json!({
                        "name": "iron-ore",
                        "unit_number": ore.unit_number,
                        "position": {"x": ore.x, "y": ore.y}
                    })
                })
                .collect();
            result["nearby"] = json!({
                "center": {"x": 0.0, "y": 0.0},
                "radius": radius,
                "entities": entities
            });
        }

        // A mined ore is still reported once, then vanishes
        for ore in ores.iter_mut() {
            if let Some(left) = ore.mining.as_mut() {
                *left = left.saturating_sub(1);
            }
        }
        result
    }
}

async fn serve(mut stream: TcpStream, world: Arc<FakeFactorio>) {
    while let Ok(packet) = read_packet(&mut stream).await {
        if packet.packet_type == packet_type::AUTH {
            world.auths.fetch_add(1, Ordering::SeqCst);
            let id = if packet.body == PASSWORD.as_bytes() { packet.id } else { -1 };
            let reply = RconPacket {
                id,
                packet_type: packet_type::AUTH_RESPONSE,
                body: Vec::new(),
            };
            if write_packet(&mut stream, &reply).await.is_err() {
                return;
            }
            continue;
        }

        if world.crash_next.swap(false, Ordering::SeqCst) {
            return;
        }

        let body = String::from_utf8(packet.body).unwrap();
        let reply = world.execute(&body);
        for chunk in reply.as_bytes().chunks(world.chunk) {
            let fragment = RconPacket {
                id: packet.id,
                packet_type: packet_type::RESPONSE_VALUE,
                body: chunk.to_vec(),
            };
            if write_packet(&mut stream, &fragment).await.is_err() {
                return;
            }
        }
    }
}

fn lua_unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn config() -> BridgeConfig {
    BridgeConfig {
        pool_size: 1,
        acquire_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ticket_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_mine_ticket_resolves_when_target_disappears() {
    let world = FakeFactorio::new(&[(5.0, 5.0), (8.0, -2.0)], 64);
    let server = world.start().await;
    let bridge = AgentBridge::new(config()).unwrap();
    let mut resolutions = bridge.subscribe("agent-1");

    let execution = bridge
        .execute("agent-1", &server, vec![Operation::mine_at(5.0, 5.0)])
        .await
        .unwrap();
    let ticket = execution.ticket(0).unwrap().clone();
    assert_eq!(ticket.status(), TicketStatus::Pending);

    // Still being mined
    let scope = QueryScope::Nearby { radius: 10.0 };
    let state = bridge.observe("agent-1", &server, scope).await.unwrap();
    assert_eq!(state.nearby.unwrap().entities.len(), 2);
    assert_eq!(ticket.status(), TicketStatus::Pending);

    // Gone on the next observation
    let state = bridge.observe("agent-1", &server, scope).await.unwrap();
    assert_eq!(state.nearby.unwrap().entities.len(), 1);
    assert_eq!(ticket.wait().await, TicketStatus::Completed);

    let resolved = resolutions.recv().await.unwrap();
    assert_eq!(resolved.id, ticket.id());
    assert_eq!(resolved.status, TicketStatus::Completed);

    let cached = bridge
        .cached(&server.id, &EntityKey::nearby("agent-1"))
        .await
        .unwrap();
    assert_eq!(cached.value().as_nearby().unwrap().entities.len(), 1);
}

#[tokio::test]
async fn test_other_agents_observations_do_not_finish_crafting() {
    let world = FakeFactorio::new(&[], 4000);
    let server = world.start().await;
    let bridge = AgentBridge::new(BridgeConfig {
        pool_size: 2,
        ..config()
    })
    .unwrap();

    let craft = Operation::Craft {
        recipe: "iron-gear-wheel".to_string(),
        count: 10,
    };
    let execution = bridge.execute("agent-a", &server, vec![craft]).await.unwrap();
    let ticket = execution.ticket(0).unwrap().clone();

    // agent-b's idle crafting queue is not agent-a's
    bridge
        .observe("agent-b", &server, QueryScope::Player)
        .await
        .unwrap();
    assert_eq!(ticket.status(), TicketStatus::Pending);

    bridge
        .observe("agent-a", &server, QueryScope::Player)
        .await
        .unwrap();
    assert_eq!(ticket.status(), TicketStatus::Completed);
}

#[tokio::test]
async fn test_failed_mine_registers_no_ticket() {
    let world = FakeFactorio::new(&[], 4000);
    let server = world.start().await;
    let bridge = AgentBridge::new(config()).unwrap();

    let execution = bridge
        .execute("agent-1", &server, vec![Operation::mine_at(1.0, 1.0)])
        .await
        .unwrap();
    assert!(execution.ticket(0).is_none());
    assert_eq!(execution.failures()[0].1, ErrorCode::NotFound);
    assert_eq!(bridge.tracker().pending_count(), 0);
}

#[tokio::test]
async fn test_large_response_is_reassembled() {
    let ores: Vec<(f64, f64)> = (0..150).map(|i| (i as f64 * 0.1, 1.0)).collect();
    let world = FakeFactorio::new(&ores, 1000);
    let server = world.start().await;
    let bridge = AgentBridge::new(config()).unwrap();

    let state = bridge
        .observe("agent-1", &server, QueryScope::All { radius: 32.0 })
        .await
        .unwrap();
    assert_eq!(state.nearby.unwrap().entities.len(), 150);
    assert!(state.player.is_some());
}

#[tokio::test]
async fn test_broken_session_is_replaced() {
    let world = FakeFactorio::new(&[], 4000);
    let server = world.start().await;
    let bridge = AgentBridge::new(config()).unwrap();

    bridge
        .observe("agent-1", &server, QueryScope::Player)
        .await
        .unwrap();
    assert_eq!(world.auths.load(Ordering::SeqCst), 1);

    world.crash_next.store(true, Ordering::SeqCst);
    let err = bridge
        .observe("agent-1", &server, QueryScope::Player)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServerUnavailable);

    let state = bridge
        .observe("agent-1", &server, QueryScope::Player)
        .await
        .unwrap();
    assert!(state.player.is_some());
    assert_eq!(world.auths.load(Ordering::SeqCst), 2);
    assert_eq!(bridge.pool().stats(&server.id).unwrap().opened, 2);
}

#[tokio::test]
async fn test_busy_pool_reports_exhaustion() {
    let world = FakeFactorio::new(&[], 4000);
    let server = world.start().await;
    let bridge = AgentBridge::new(BridgeConfig {
        payload_ceiling: 200,
        ..config()
    })
    .unwrap();

    // A half-sent submission keeps the only session checked out
    let moves = (0..10)
        .map(|_| Operation::Move {
            direction: agent_bridge_core::Direction::South,
        })
        .collect();
    let mut submission = bridge.submit("agent-1", &server, moves).unwrap();
    assert!(submission.pending() > 1);
    submission.dispatch_next().await.unwrap();

    let err = bridge
        .observe("agent-2", &server, QueryScope::Player)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PoolExhausted);

    submission.cancel();
    bridge
        .observe("agent-2", &server, QueryScope::Player)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_wrong_password_marks_server_unreachable() {
    let world = FakeFactorio::new(&[], 4000);
    let mut server = world.start().await;
    server.password = "wrong".to_string();

    let mut config = config();
    config.backoff.initial_delay = Duration::from_millis(1);
    config.backoff.max_retries = 1;
    let bridge = AgentBridge::new(config).unwrap();

    let err = bridge
        .observe("agent-1", &server, QueryScope::Player)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServerUnavailable);
    assert!(bridge.pool().is_unreachable(&server.id));
    assert_eq!(world.auths.load(Ordering::SeqCst), 2);
}
