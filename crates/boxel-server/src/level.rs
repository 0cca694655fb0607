// level.rs — the block store
//
// A level is a dense 3D array of block type bytes plus a little metadata,
// indexed x + size.x*(z + size.z*y). The on-disk form is a gzip stream of
// a 32-bit big-endian block count followed by the raw type bytes in the
// same order.

use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use tracing::warn;

use boxel_common::blocks::{Block, EMPTY};
use boxel_common::clock::WallTime;
use boxel_common::gzip::{gzip_compress, gzip_decompress};

pub const LEVEL_SIZE_X: i32 = 256;
pub const LEVEL_SIZE_Y: i32 = 64;
pub const LEVEL_SIZE_Z: i32 = 256;

pub const LEVEL_NAME: &str = "boxel world";
pub const LEVEL_CREATOR: &str = "boxel";

/// The six principal directions, in -x, -y, -z, +x, +y, +z order.
pub const DX: [i32; 6] = [-1, 0, 0, 1, 0, 0];
pub const DY: [i32; 6] = [0, -1, 0, 0, 1, 0];
pub const DZ: [i32; 6] = [0, 0, -1, 0, 0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vec3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Vec3i {
    pub const fn new(x: i32, y: i32, z: i32) -> Vec3i {
        Vec3i { x, y, z }
    }

    pub const fn volume(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Per-connection player state.
#[derive(Debug, Clone, Default)]
pub struct Player {
    pub name: String,
    pub pos: Vec3f,
    pub yaw: f32,
    pub pitch: f32,
    pub tileset: u8,
    pub admin: bool,
}

pub struct Level {
    pub size: Vec3i,
    blocks: Vec<Block>,
    pub name: String,
    pub creator: String,
    pub spawn: Vec3i,
    pub rot_spawn: f32,
    pub tick_count: u64,
    dirty: bool,
    pub save_time: WallTime,
}

impl Level {
    /// Creates an all-empty level of the given size, with the spawn point
    /// centered near the top of the world.
    pub fn new(size: Vec3i, name: &str, creator: &str) -> Level {
        Level {
            size,
            blocks: vec![EMPTY; size.volume()],
            name: name.to_owned(),
            creator: creator.to_owned(),
            spawn: Vec3i::new(size.x / 2, size.y - 5, size.z / 2),
            rot_spawn: 0.0,
            tick_count: 0,
            dirty: false,
            save_time: WallTime::now(),
        }
    }

    pub fn index_valid(&self, x: i32, y: i32, z: i32) -> bool {
        (0..self.size.x).contains(&x)
            && (0..self.size.y).contains(&y)
            && (0..self.size.z).contains(&z)
    }

    fn idx(&self, x: i32, y: i32, z: i32) -> usize {
        x as usize + self.size.x as usize * (z as usize + self.size.z as usize * y as usize)
    }

    /// Returns the block type at the given cell, or `EMPTY` for any
    /// out-of-bounds coordinate.
    pub fn get(&self, x: i32, y: i32, z: i32) -> Block {
        if !self.index_valid(x, y, z) {
            return EMPTY;
        }
        self.blocks[self.idx(x, y, z)]
    }

    /// Sets the block type at the given cell and returns the previous
    /// value. Out-of-bounds writes are dropped with a warning and return
    /// `new_t` unchanged.
    pub fn set(&mut self, x: i32, y: i32, z: i32, new_t: Block) -> Block {
        if !self.index_valid(x, y, z) {
            warn!("invalid level index {x},{y},{z}");
            return new_t;
        }
        let i = self.idx(x, y, z);
        let old_t = self.blocks[i];
        if old_t != new_t {
            self.blocks[i] = new_t;
            self.dirty = true;
        }
        old_t
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tick(&mut self) {
        self.tick_count += 1;
    }

    /// Serializes the level into its uncompressed file payload: a 32-bit
    /// big-endian block count followed by the raw block bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + self.blocks.len());
        payload.extend_from_slice(&(self.blocks.len() as u32).to_be_bytes());
        payload.extend_from_slice(&self.blocks);
        payload
    }

    /// Loads a level of the distributed default size from a gzip file.
    pub fn load(path: &Path) -> Result<Level> {
        let compressed = std::fs::read(path)
            .with_context(|| format!("could not open {} for reading", path.display()))?;
        let payload = gzip_decompress(&compressed)
            .with_context(|| format!("could not decompress {}", path.display()))?;

        let mut reader = payload.as_slice();
        let count = reader.read_u32::<BigEndian>().context("level file truncated")? as usize;

        let size = Vec3i::new(LEVEL_SIZE_X, LEVEL_SIZE_Y, LEVEL_SIZE_Z);
        if count != size.volume() {
            bail!(
                "recorded world contains {count} blocks; {} expected",
                size.volume()
            );
        }

        let mut level = Level::new(size, LEVEL_NAME, LEVEL_CREATOR);
        reader
            .read_exact(&mut level.blocks)
            .context("failed to read block data")?;
        Ok(level)
    }

    /// Saves the level; the dirty flag is cleared and the save time
    /// stamped only if the write succeeds.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let compressed = gzip_compress(&self.encode()).context("failed to compress level")?;
        std::fs::write(path, compressed)
            .with_context(|| format!("could not write {}", path.display()))?;
        self.dirty = false;
        self.save_time = WallTime::now();
        Ok(())
    }
}
