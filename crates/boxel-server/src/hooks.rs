// hooks.rs — the block-rule engine
//
// All world dynamics live here: which modifications a player may make, how
// fluids spread, how sponges dry them up, and how soil reacts to light.
// The rules never touch the level directly; every change goes through the
// Engine trait so the server can broadcast deltas and chain reactions, and
// tests can run the rules against a bare level.
//
// Event handlers start with a relevance check and silently return when the
// world has moved on — the queue has no cancellation, so stale entries are
// expected.

use rand::Rng;
use tracing::info;

use boxel_common::blocks::{self, Block, CLIENT_TYPE_MASK};
use boxel_common::clock::{TimeDelta, WallTime};

use crate::events::{Event, EventKind};
use crate::level::{Level, Player, DX, DY, DZ};

/// Shared secret for the `/auth` chat command.
pub const AUTH_SECRET: &str = "fiets";

const WATER_FLOW_DELAY: TimeDelta = TimeDelta::new(0, 300_000);
const LAVA_FLOW_DELAY: TimeDelta = TimeDelta::new(3, 0);
const SUPERSPONGE_DELAY: TimeDelta = TimeDelta::new(0, 250_000);

const GROW_DELAY_MIN_SEC: i64 = 3;
const GROW_DELAY_MAX_SEC: i64 = 60;

/// Radius of the cube a sponge keeps dry.
const SPONGE_RADIUS: i32 = 3;

/// How the rule engine reaches back into the server: level reads, event
/// posting, and block mutation (synchronous when `delay` is zero,
/// otherwise deferred via an update event).
pub trait Engine {
    fn level(&self) -> &Level;
    fn post_event(&mut self, event: Event);
    fn update_block(&mut self, x: i32, y: i32, z: i32, new_t: Block, delay: TimeDelta);
}

pub fn is_fluid(t: Block) -> bool {
    (blocks::WATER1..=blocks::LAVA2).contains(&t)
}

pub fn is_water(t: Block) -> bool {
    t == blocks::WATER1 || t == blocks::WATER2
}

pub fn is_lava(t: Block) -> bool {
    t == blocks::LAVA1 || t == blocks::LAVA2
}

pub fn is_plant(t: Block) -> bool {
    matches!(
        t,
        blocks::SAPLING
            | blocks::FLOWER_YELLOW
            | blocks::FLOWER_RED
            | blocks::MUSHROOM
            | blocks::TOADSTOOL
    )
}

pub fn is_light_blocker(t: Block) -> bool {
    t != blocks::EMPTY && t != blocks::GLASS && t != blocks::LEAVES && !is_plant(t)
}

pub fn is_soil(t: Block) -> bool {
    t == blocks::DIRT || t == blocks::GRASS
}

pub fn is_player_placeable(t: Block, admin: bool) -> bool {
    match t {
        blocks::STONE_GREY
        | blocks::DIRT
        | blocks::ROCK
        | blocks::WOOD
        | blocks::SAPLING
        | blocks::STONE_YELLOW
        | blocks::STONE_MIXED
        | blocks::TRUNK
        | blocks::LEAVES
        | blocks::SPONGE
        | blocks::GLASS
        | blocks::COLORED1
        | blocks::COLORED2
        | blocks::COLORED3
        | blocks::COLORED4
        | blocks::COLORED5
        | blocks::COLORED6
        | blocks::COLORED7
        | blocks::COLORED8
        | blocks::COLORED9
        | blocks::COLORED10
        | blocks::COLORED11
        | blocks::COLORED12
        | blocks::COLORED13
        | blocks::COLORED14
        | blocks::COLORED15
        | blocks::COLORED16
        | blocks::FLOWER_YELLOW
        | blocks::FLOWER_RED
        | blocks::MUSHROOM
        | blocks::TOADSTOOL
        | blocks::GOLD => true,

        blocks::SUPERSPONGE | blocks::LAVA2 | blocks::WATER2 | blocks::ADMINIUM => admin,

        _ => false,
    }
}

pub fn is_player_deletable(t: Block, admin: bool) -> bool {
    match t {
        blocks::GRASS | blocks::ORE1 | blocks::ORE2 | blocks::ORE3 => true,
        _ => is_player_placeable(t, admin),
    }
}

pub fn is_player_replaceable(t: Block, _admin: bool) -> bool {
    is_fluid(t)
}

/// Strips server-only bits to produce the type a client may see.
pub fn client_block_type(t: Block) -> Block {
    t & CLIENT_TYPE_MASK
}

/// Returns whether the cube with sides of length 2*`d` - 1 centered at
/// (x,y,z), clipped to the grid, contains a block of type `t`.
fn type_nearby(level: &Level, x: i32, y: i32, z: i32, t: Block, d: i32) -> bool {
    let x1 = (x - d + 1).max(0);
    let x2 = (x + d).min(level.size.x);
    let y1 = (y - d + 1).max(0);
    let y2 = (y + d).min(level.size.y);
    let z1 = (z - d + 1).max(0);
    let z2 = (z + d).min(level.size.z);

    for cx in x1..x2 {
        for cy in y1..y2 {
            for cz in z1..z2 {
                if level.get(cx, cy, cz) == t {
                    return true;
                }
            }
        }
    }
    false
}

/// Decides whether a requested modification is allowed, and what server
/// type it results in. `new_t` arrives in client space; the result is a
/// server type, or `None` when the request is rejected.
pub fn authorize_update(
    level: &Level,
    player: &Player,
    x: i32,
    y: i32,
    z: i32,
    old_t: Block,
    new_t: Block,
) -> Option<Block> {
    // Reject updates that don't change anything.
    if old_t == new_t {
        return None;
    }

    // Tileset mapping: some client types are reinterpreted server-side.
    let mut new_t = new_t;
    if player.tileset == 1 {
        new_t = match new_t {
            blocks::COLORED1 => blocks::LAVA2,
            blocks::COLORED3 => blocks::SUPERSPONGE,
            blocks::COLORED8 => blocks::WATER2,
            blocks::COLORED14 => blocks::ADMINIUM,
            t => t,
        };
    }

    if old_t != blocks::EMPTY && new_t != blocks::EMPTY {
        // Replacing a block.
        if !is_player_replaceable(old_t, player.admin) || !is_player_placeable(new_t, player.admin)
        {
            return None;
        }
    } else if old_t != blocks::EMPTY {
        // Deleting a block.
        if !is_player_deletable(old_t, player.admin) {
            return None;
        }
    } else if new_t != blocks::EMPTY {
        // Placing a block.
        if !is_player_placeable(new_t, player.admin) {
            return None;
        }
    }

    // An emptied cell next to a fluid fills back up, unless a sponge keeps
    // the area dry. Fluid directly below the cell never climbs into it.
    if new_t == blocks::EMPTY && !type_nearby(level, x, y, z, blocks::SPONGE, SPONGE_RADIUS) {
        for d in 0..6 {
            if DY[d] < 0 {
                continue;
            }
            let t = level.get(x + DX[d], y + DY[d], z + DZ[d]);
            if is_fluid(t) {
                new_t = t;
                break;
            }
        }
    }

    // Plants must stand on soil.
    if is_plant(new_t) && !is_soil(level.get(x, y - 1, z)) {
        return None;
    }

    info!(
        "player {} sets block of type {new_t} at ({x},{y},{z})",
        player.name
    );
    Some(new_t)
}

fn post_flow_event(eng: &mut impl Engine, x: i32, y: i32, z: i32, delay: TimeDelta) {
    eng.post_event(Event {
        time: WallTime::now() + delay,
        kind: EventKind::Flow { x, y, z },
    });
}

fn post_grow_event(eng: &mut impl Engine, x: i32, y: i32, z: i32) {
    let delay = TimeDelta::new(
        rand::thread_rng().gen_range(GROW_DELAY_MIN_SEC..=GROW_DELAY_MAX_SEC),
        0,
    );
    eng.post_event(Event {
        time: WallTime::now() + delay,
        kind: EventKind::Grow { x, y, z },
    });
}

/// Pokes one cell: fluids schedule a flow check, dirt schedules growth,
/// grass and plants react to their surroundings immediately.
fn activate_block(eng: &mut impl Engine, x: i32, y: i32, z: i32) {
    let t = eng.level().get(x, y, z);
    match t {
        blocks::WATER1 | blocks::WATER2 => post_flow_event(eng, x, y, z, WATER_FLOW_DELAY),
        blocks::LAVA1 | blocks::LAVA2 => post_flow_event(eng, x, y, z, LAVA_FLOW_DELAY),

        blocks::DIRT => post_grow_event(eng, x, y, z),

        blocks::GRASS => {
            if is_light_blocker(eng.level().get(x, y + 1, z)) {
                eng.update_block(x, y, z, blocks::DIRT, TimeDelta::ZERO);
            }
        }

        t if is_plant(t) => {
            if !is_soil(eng.level().get(x, y - 1, z)) {
                eng.update_block(x, y, z, blocks::EMPTY, TimeDelta::ZERO);
            }
        }

        _ => {}
    }
}

/// Activates every cell in the cube of side 2*`d` + 1 centered at (x,y,z).
fn activate_blocks_nearby(eng: &mut impl Engine, x: i32, y: i32, z: i32, d: i32) {
    let size = eng.level().size;
    let x1 = (x - d).max(0);
    let x2 = (x + d + 1).min(size.x);
    let y1 = (y - d).max(0);
    let y2 = (y + d + 1).min(size.y);
    let z1 = (z - d).max(0);
    let z2 = (z + d + 1).min(size.z);

    for cx in x1..x2 {
        for cy in y1..y2 {
            for cz in z1..z2 {
                activate_block(eng, cx, cy, cz);
            }
        }
    }
}

fn activate_neighbours(eng: &mut impl Engine, x: i32, y: i32, z: i32) {
    for d in 0..6 {
        activate_block(eng, x + DX[d], y + DY[d], z + DZ[d]);
    }
}

fn on_update(eng: &mut impl Engine, x: i32, y: i32, z: i32, old_t: Block, new_t: Block) {
    // Another update superseded this one.
    if eng.level().get(x, y, z) != new_t {
        return;
    }

    match new_t {
        blocks::SPONGE => {
            // Dry up every fluid cell the sponge reaches.
            let size = eng.level().size;
            let x1 = (x - SPONGE_RADIUS + 1).max(0);
            let x2 = (x + SPONGE_RADIUS).min(size.x);
            let y1 = (y - SPONGE_RADIUS + 1).max(0);
            let y2 = (y + SPONGE_RADIUS).min(size.y);
            let z1 = (z - SPONGE_RADIUS + 1).max(0);
            let z2 = (z + SPONGE_RADIUS).min(size.z);

            for cx in x1..x2 {
                for cy in y1..y2 {
                    for cz in z1..z2 {
                        if is_fluid(eng.level().get(cx, cy, cz)) {
                            eng.update_block(cx, cy, cz, blocks::EMPTY, TimeDelta::ZERO);
                        }
                    }
                }
            }
        }

        blocks::SUPERSPONGE => {
            // Flood-filling sponge: claim each adjacent fluid cell after a
            // short delay, then burn out.
            for d in 0..6 {
                let nx = x + DX[d];
                let ny = y + DY[d];
                let nz = z + DZ[d];
                if is_fluid(eng.level().get(nx, ny, nz)) {
                    eng.update_block(nx, ny, nz, blocks::SUPERSPONGE, SUPERSPONGE_DELAY);
                }
            }
            eng.update_block(x, y, z, blocks::EMPTY, TimeDelta::ZERO);
        }

        _ => {}
    }

    if old_t == blocks::SPONGE {
        // A sponge was removed; everything it was suppressing may react.
        activate_blocks_nearby(eng, x, y, z, SPONGE_RADIUS);
    } else {
        activate_block(eng, x, y, z);
        activate_neighbours(eng, x, y, z);
    }
}

fn on_flow(eng: &mut impl Engine, x: i32, y: i32, z: i32) {
    let t = eng.level().get(x, y, z);
    if !is_fluid(t) {
        return;
    }

    for d in 0..6 {
        // Fluids never flow upward.
        if DY[d] > 0 {
            continue;
        }

        let nx = x + DX[d];
        let ny = y + DY[d];
        let nz = z + DZ[d];
        if !eng.level().index_valid(nx, ny, nz) {
            continue;
        }

        let u = eng.level().get(nx, ny, nz);
        if u == blocks::EMPTY && !type_nearby(eng.level(), nx, ny, nz, blocks::SPONGE, SPONGE_RADIUS)
        {
            eng.update_block(nx, ny, nz, t, TimeDelta::ZERO);
        } else if (is_water(t) && is_lava(u)) || (is_lava(t) && is_water(u)) {
            // Water and lava fuse to stone.
            eng.update_block(nx, ny, nz, blocks::STONE_GREY, TimeDelta::ZERO);
        }
    }
}

fn on_grow(eng: &mut impl Engine, x: i32, y: i32, z: i32) {
    if eng.level().get(x, y, z) == blocks::DIRT
        && !is_light_blocker(eng.level().get(x, y + 1, z))
    {
        eng.update_block(x, y, z, blocks::GRASS, TimeDelta::ZERO);
    }
}

/// Dispatches one simulation event into the rules above. Tick and save
/// events are handled by the server loop, not here.
pub fn on_event(eng: &mut impl Engine, event: &Event) {
    match event.kind {
        EventKind::Update { x, y, z, old_t, new_t } => on_update(eng, x, y, z, old_t, new_t),
        EventKind::Flow { x, y, z } => on_flow(eng, x, y, z),
        EventKind::Grow { x, y, z } => on_grow(eng, x, y, z),
        EventKind::Tick | EventKind::Save => {}
    }
}

/// Outcome of a chat line: nothing, a private reply to the sender, or a
/// message for everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    None,
    Private(String),
    Broadcast(String),
}

pub fn on_chat(player: &mut Player, text: &str) -> ChatReply {
    if let Some(rest) = text.strip_prefix("/auth") {
        if let Some(secret) = rest.split_whitespace().next() {
            player.admin = secret == AUTH_SECRET;
            let verdict = if player.admin { "granted" } else { "denied" };
            return ChatReply::Private(format!("access {verdict}"));
        }
    }

    if let Some(rest) = text.strip_prefix("/set tileset") {
        if rest.is_empty() {
            return ChatReply::Private(format!("current tileset: {}", player.tileset));
        }
        if let Ok(n) = rest.trim().parse::<i32>() {
            if (0..2).contains(&n) {
                player.tileset = n as u8;
            }
            return ChatReply::None;
        }
    }

    ChatReply::Broadcast(format!("{}: {text}", player.name))
}
