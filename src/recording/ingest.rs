// src/recording/ingest.rs
//! Host-facing ingestion entry points
//!
//! The host simulation calls one method per observed event. Each entry point
//! checks its event category toggle, builds a record stamped by a
//! per-recorder monotonic clock and enqueues it. Nothing here returns an
//! error to the host: invalid events and full buffers are logged and the
//! method reports `false`.

use crate::record::{
    BlockState, Cause, EntitySnapshot, EventType, Location, MonotonicClock, PlayerRef,
    RecordBuilder, SessionId,
};
use crate::recording::RecordingQueueManager;
use crate::utils::config::EventToggles;
use std::sync::Arc;
use tracing::{debug, warn};

/// A block was removed
#[derive(Debug, Clone)]
pub struct BlockBreakEvent {
    pub location: Location,
    pub block: BlockState,
    pub player: Option<PlayerRef>,
    pub causes: Vec<Cause>,
}

/// A block was placed, possibly replacing another
#[derive(Debug, Clone)]
pub struct BlockPlaceEvent {
    pub location: Location,
    pub placed: BlockState,
    pub replaced: Option<BlockState>,
    pub player: Option<PlayerRef>,
    pub causes: Vec<Cause>,
}

/// Blocks destroyed by one explosion
#[derive(Debug, Clone)]
pub struct ExplosionEvent {
    pub blocks: Vec<(Location, BlockState)>,
    pub player: Option<PlayerRef>,
    pub causes: Vec<Cause>,
}

#[derive(Debug, Clone)]
pub struct EntityDeathEvent {
    pub location: Location,
    pub entity: EntitySnapshot,
    pub player: Option<PlayerRef>,
    pub causes: Vec<Cause>,
}

#[derive(Debug, Clone)]
pub struct EntitySpawnEvent {
    pub location: Location,
    pub entity: EntitySnapshot,
    pub player: Option<PlayerRef>,
    pub causes: Vec<Cause>,
}

#[derive(Debug, Clone)]
pub struct SignChangeEvent {
    pub location: Location,
    /// Block type of the sign
    pub sign_type: String,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub player: Option<PlayerRef>,
}

/// Join or disconnect
#[derive(Debug, Clone)]
pub struct PlayerConnectionEvent {
    pub player: PlayerRef,
    pub location: Option<Location>,
}

#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub player: PlayerRef,
    pub location: Location,
    /// Full command line as typed
    pub command: String,
}

/// Turns host events into queued records
pub struct Recorder {
    queue: Arc<RecordingQueueManager>,
    toggles: EventToggles,
    clock: MonotonicClock,
}

impl Recorder {
    /// Create a recorder feeding `queue`
    pub fn new(queue: Arc<RecordingQueueManager>, toggles: EventToggles) -> Self {
        Self {
            queue,
            toggles,
            clock: MonotonicClock::new(),
        }
    }

    pub fn toggles(&self) -> &EventToggles {
        &self.toggles
    }

    pub fn block_break(&self, event: BlockBreakEvent) -> bool {
        if !self.toggles.block_break {
            return false;
        }
        let builder = RecordBuilder::new(EventType::BlockBreak)
            .location(event.location)
            .block_break(event.block);
        self.submit(attribute(builder, event.player, event.causes))
    }

    pub fn block_place(&self, event: BlockPlaceEvent) -> bool {
        if !self.toggles.block_place {
            return false;
        }
        let builder = RecordBuilder::new(EventType::BlockPlace)
            .location(event.location)
            .block_place(event.placed, event.replaced);
        self.submit(attribute(builder, event.player, event.causes))
    }

    /// Log every destroyed block under one shared session.
    ///
    /// Returns the session when at least one record was queued.
    pub fn block_explosion(&self, event: ExplosionEvent) -> Option<SessionId> {
        if !self.toggles.block_break || event.blocks.is_empty() {
            return None;
        }

        let session = SessionId::new();
        let mut queued = 0;
        for (location, block) in event.blocks {
            let builder = RecordBuilder::new(EventType::BlockBreak)
                .location(location)
                .block_break(block)
                .session(session);
            if self.submit(attribute(builder, event.player.clone(), event.causes.clone())) {
                queued += 1;
            }
        }

        debug!("Explosion logged {} block records under {}", queued, session);
        (queued > 0).then_some(session)
    }

    /// Entity death; hanging entities and armor stands count as block breaks
    pub fn entity_death(&self, event: EntityDeathEvent) -> bool {
        let kind = if event.entity.block_like {
            if !self.toggles.block_break {
                return false;
            }
            EventType::BlockBreak
        } else {
            if !self.toggles.entity_death {
                return false;
            }
            EventType::EntityDeath
        };

        let builder = RecordBuilder::new(kind)
            .location(event.location)
            .entity(event.entity);
        self.submit(attribute(builder, event.player, event.causes))
    }

    /// Only block-like entities (hanging, armor stands) are recorded, as placements
    pub fn entity_spawn(&self, event: EntitySpawnEvent) -> bool {
        if !event.entity.block_like || !self.toggles.block_place {
            return false;
        }
        let builder = RecordBuilder::new(EventType::BlockPlace)
            .location(event.location)
            .entity(event.entity);
        self.submit(attribute(builder, event.player, event.causes))
    }

    pub fn sign_change(&self, event: SignChangeEvent) -> bool {
        if !self.toggles.sign_change {
            return false;
        }
        let builder = RecordBuilder::new(EventType::SignEdit)
            .location(event.location)
            .target(&event.sign_type)
            .sign_edit(event.before, event.after);
        self.submit(attribute(builder, event.player, Vec::new()))
    }

    pub fn player_join(&self, event: PlayerConnectionEvent) -> bool {
        if !self.toggles.player_join {
            return false;
        }
        self.submit(connection(EventType::PlayerJoin, event))
    }

    pub fn player_disconnect(&self, event: PlayerConnectionEvent) -> bool {
        if !self.toggles.player_disconnect {
            return false;
        }
        self.submit(connection(EventType::PlayerDisconnect, event))
    }

    pub fn command(&self, event: CommandEvent) -> bool {
        if !self.toggles.command_execute {
            return false;
        }
        let builder = RecordBuilder::new(EventType::CommandExecute)
            .location(event.location)
            .raw_target(&event.command)
            .player(event.player.clone())
            .cause(Cause::Player(event.player));
        self.submit(builder)
    }

    fn submit(&self, builder: RecordBuilder) -> bool {
        let record = match builder.build_at(self.clock.now()) {
            Ok(record) => record,
            Err(e) => {
                warn!("Discarding invalid event: {}", e);
                return false;
            }
        };

        match self.queue.enqueue(record) {
            Ok(()) => true,
            Err(e) => {
                debug!("Record not queued: {}", e);
                false
            }
        }
    }
}

fn attribute(builder: RecordBuilder, player: Option<PlayerRef>, causes: Vec<Cause>) -> RecordBuilder {
    let builder = builder.causes(causes);
    match player {
        Some(player) => builder.player(player),
        None => builder,
    }
}

fn connection(kind: EventType, event: PlayerConnectionEvent) -> RecordBuilder {
    let builder = RecordBuilder::new(kind)
        .player(event.player.clone())
        .cause(Cause::Player(event.player));
    match event.location {
        Some(location) => builder.location(location),
        None => builder,
    }
}
