//! Last observed state per server and entity
//!
//! Entries are written only from responses (or explicit invalidation) and
//! the most recent server tick wins. Deciding whether an entry is still
//! fresh enough is up to the caller, which passes a [`Staleness`] rule.

use agent_bridge_core::{
    EntityScan, Inventory, ObservedState, PlayerState, Position, ServerId, StateKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// What is cached: a kind of state plus the agent or entity it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: StateKind,
    pub key: String,
}

impl EntityKey {
    pub fn new(kind: StateKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    pub fn player(agent: &str) -> Self {
        Self::new(StateKind::Player, agent)
    }

    pub fn inventory(agent: &str) -> Self {
        Self::new(StateKind::Inventory, agent)
    }

    /// Entity scan taken around an agent
    pub fn nearby(agent: &str) -> Self {
        Self::new(StateKind::NearbyEntities, agent)
    }
}

/// A cached value
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Player(PlayerState),
    Inventory(Inventory),
    Nearby(EntityScan),
}

impl CachedValue {
    pub fn kind(&self) -> StateKind {
        match self {
            CachedValue::Player(_) => StateKind::Player,
            CachedValue::Inventory(_) => StateKind::Inventory,
            CachedValue::Nearby(_) => StateKind::NearbyEntities,
        }
    }

    /// Where the value was observed from, if it has a location
    pub fn position(&self) -> Option<Position> {
        match self {
            CachedValue::Player(player) => Some(player.position),
            CachedValue::Nearby(scan) => Some(scan.center),
            CachedValue::Inventory(_) => None,
        }
    }

    pub fn as_player(&self) -> Option<&PlayerState> {
        match self {
            CachedValue::Player(player) => Some(player),
            _ => None,
        }
    }

    pub fn as_inventory(&self) -> Option<&Inventory> {
        match self {
            CachedValue::Inventory(inventory) => Some(inventory),
            _ => None,
        }
    }

    pub fn as_nearby(&self) -> Option<&EntityScan> {
        match self {
            CachedValue::Nearby(scan) => Some(scan),
            _ => None,
        }
    }
}

/// A value with the tick and time it was observed at
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    value: CachedValue,
    observed_tick: u64,
    observed_at: Instant,
}

impl CacheEntry {
    pub fn value(&self) -> &CachedValue {
        &self.value
    }

    pub fn observed_tick(&self) -> u64 {
        self.observed_tick
    }

    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.observed_at)
    }
}

/// What the caller currently knows, for judging freshness
#[derive(Debug, Clone, Copy)]
pub struct FreshnessContext {
    pub now: Instant,
    pub current_tick: Option<u64>,
    pub current_position: Option<Position>,
}

impl FreshnessContext {
    pub fn now() -> Self {
        Self {
            now: Instant::now(),
            current_tick: None,
            current_position: None,
        }
    }

    pub fn at_tick(mut self, tick: u64) -> Self {
        self.current_tick = Some(tick);
        self
    }

    pub fn at_position(mut self, position: Position) -> Self {
        self.current_position = Some(position);
        self
    }
}

/// Caller-supplied rule for when a cached value is too old to trust
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Staleness {
    /// Always fresh
    Never,
    /// Fresh for a wall-clock duration after observation
    MaxAge(Duration),
    /// Fresh for a number of server ticks after observation
    MaxTicks(u64),
    /// Fresh until the caller moves further than this from where the value
    /// was observed
    MovedBeyond(f64),
}

impl Staleness {
    /// Whether `entry` may still be used. Missing context counts as stale.
    pub fn is_fresh(&self, entry: &CacheEntry, context: &FreshnessContext) -> bool {
        match *self {
            Staleness::Never => true,
            Staleness::MaxAge(max) => entry.age(context.now) <= max,
            Staleness::MaxTicks(max) => context
                .current_tick
                .is_some_and(|tick| tick.saturating_sub(entry.observed_tick) <= max),
            Staleness::MovedBeyond(distance) => {
                match (entry.value.position(), context.current_position) {
                    (Some(observed), Some(current)) => observed.distance(&current) <= distance,
                    _ => false,
                }
            }
        }
    }
}

/// Current entry of a key plus the highest tick it was ever written at.
///
/// The mark survives invalidation, so a late response carrying an older
/// tick cannot bring back state that a newer one already replaced.
#[derive(Debug, Default)]
struct Slot {
    entry: Option<CacheEntry>,
    high_water: u64,
}

type Slots = HashMap<(ServerId, EntityKey), Slot>;

/// Shared cache of observed state
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    slots: Arc<RwLock<Slots>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry, or `None` on a miss
    pub async fn get(&self, server: &ServerId, key: &EntityKey) -> Option<CacheEntry> {
        let slots = self.slots.read().await;
        slots
            .get(&(server.clone(), key.clone()))
            .and_then(|slot| slot.entry.clone())
    }

    /// Cached entry that passes `staleness`
    pub async fn get_fresh(
        &self,
        server: &ServerId,
        key: &EntityKey,
        staleness: &Staleness,
        context: &FreshnessContext,
    ) -> Option<CacheEntry> {
        self.get(server, key)
            .await
            .filter(|entry| staleness.is_fresh(entry, context))
    }

    /// Store a value observed at `observed_tick`.
    ///
    /// Returns false when the key already saw a later tick, even if its
    /// entry has since been invalidated.
    pub async fn put(
        &self,
        server: &ServerId,
        key: EntityKey,
        value: CachedValue,
        observed_tick: u64,
    ) -> bool {
        let mut slots = self.slots.write().await;
        put_entry(&mut slots, server, key, value, Some(observed_tick))
    }

    /// Drop the entry; its tick still bounds later writes
    pub async fn invalidate(&self, server: &ServerId, key: &EntityKey) -> bool {
        let mut slots = self.slots.write().await;
        slots
            .get_mut(&(server.clone(), key.clone()))
            .and_then(|slot| slot.entry.take())
            .is_some()
    }

    /// Drop the entry if it was observed at or before `tick`.
    ///
    /// An entry from a later tick is kept. Either way nothing older than
    /// `tick` is accepted for the key afterwards.
    pub async fn invalidate_through(&self, server: &ServerId, key: &EntityKey, tick: u64) -> bool {
        let mut slots = self.slots.write().await;
        let slot = slots.entry((server.clone(), key.clone())).or_default();
        slot.high_water = slot.high_water.max(tick);
        if slot
            .entry
            .as_ref()
            .is_some_and(|entry| entry.observed_tick <= tick)
        {
            slot.entry = None;
            true
        } else {
            false
        }
    }

    /// Forget everything about `server`, tick marks included
    pub async fn invalidate_server(&self, server: &ServerId) -> usize {
        let mut slots = self.slots.write().await;
        let removed = slots
            .iter()
            .filter(|((id, _), slot)| id == server && slot.entry.is_some())
            .count();
        slots.retain(|(id, _), _| id != server);
        removed
    }

    /// Record everything `state` reports for `agent`.
    ///
    /// A state without a tick is treated as observed at the latest tick
    /// seen for the key, so it still replaces the entry. Returns how many
    /// entries changed.
    pub async fn ingest(&self, server: &ServerId, agent: &str, state: &ObservedState) -> usize {
        let mut updates = Vec::with_capacity(3);
        if let Some(player) = &state.player {
            updates.push((EntityKey::player(agent), CachedValue::Player(player.clone())));
        }
        if let Some(inventory) = &state.inventory {
            updates.push((
                EntityKey::inventory(agent),
                CachedValue::Inventory(inventory.clone()),
            ));
        }
        if let Some(scan) = &state.nearby {
            updates.push((EntityKey::nearby(agent), CachedValue::Nearby(scan.clone())));
        }
        if updates.is_empty() {
            return 0;
        }

        let mut slots = self.slots.write().await;
        let changed = updates
            .into_iter()
            .filter(|(key, value)| {
                put_entry(&mut slots, server, key.clone(), value.clone(), state.tick)
            })
            .count();
        debug!(
            "Cached {} state component(s) for {} on {}",
            changed, agent, server
        );
        changed
    }

    /// Highest tick among the entries cached for `server`
    pub async fn latest_tick(&self, server: &ServerId) -> Option<u64> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .filter(|((id, _), _)| id == server)
            .filter_map(|(_, slot)| slot.entry.as_ref())
            .map(|entry| entry.observed_tick)
            .max()
    }

    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.entry.is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn put_entry(
    slots: &mut Slots,
    server: &ServerId,
    key: EntityKey,
    value: CachedValue,
    observed_tick: Option<u64>,
) -> bool {
    let kind = key.kind;
    let slot = slots.entry((server.clone(), key)).or_default();

    let tick = match observed_tick {
        Some(tick) if tick < slot.high_water => {
            debug!(
                "Ignoring {:?} observed at tick {} (already seen tick {})",
                kind, tick, slot.high_water
            );
            return false;
        }
        Some(tick) => tick,
        None => slot.high_water,
    };

    slot.high_water = tick;
    slot.entry = Some(CacheEntry {
        value,
        observed_tick: tick,
        observed_at: Instant::now(),
    });
    true
}
