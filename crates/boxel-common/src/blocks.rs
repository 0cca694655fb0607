// blocks.rs — block type identifiers
//
// A block type is a single byte. The low six bits are the client-visible
// type; the high bits are reserved for server-only variants.

pub type Block = u8;

pub const EMPTY: Block = 0;
pub const STONE_GREY: Block = 1;
pub const GRASS: Block = 2;
pub const DIRT: Block = 3;
pub const ROCK: Block = 4;
pub const WOOD: Block = 5;
pub const SAPLING: Block = 6;
pub const ADMINIUM: Block = 7;
pub const WATER1: Block = 8;
pub const WATER2: Block = 9;
pub const LAVA1: Block = 10;
pub const LAVA2: Block = 11;
pub const STONE_YELLOW: Block = 12;
pub const STONE_MIXED: Block = 13;
pub const ORE1: Block = 14;
pub const ORE2: Block = 15;
pub const ORE3: Block = 16;
pub const TRUNK: Block = 17;
pub const LEAVES: Block = 18;
pub const SPONGE: Block = 19;
pub const GLASS: Block = 20;
pub const COLORED1: Block = 21;
pub const COLORED2: Block = 22;
pub const COLORED3: Block = 23;
pub const COLORED4: Block = 24;
pub const COLORED5: Block = 25;
pub const COLORED6: Block = 26;
pub const COLORED7: Block = 27;
pub const COLORED8: Block = 28;
pub const COLORED9: Block = 29;
pub const COLORED10: Block = 30;
pub const COLORED11: Block = 31;
pub const COLORED12: Block = 32;
pub const COLORED13: Block = 33;
pub const COLORED14: Block = 34;
pub const COLORED15: Block = 35;
pub const COLORED16: Block = 36;
pub const FLOWER_YELLOW: Block = 37;
pub const FLOWER_RED: Block = 38;
pub const MUSHROOM: Block = 39;
pub const TOADSTOOL: Block = 40;
pub const GOLD: Block = 41;

/// Server-only flag; types carrying it must be masked before they reach a
/// client.
pub const SUPER: Block = 64;
pub const SUPERSPONGE: Block = SPONGE | SUPER;

/// Mask selecting the client-visible part of a block type.
pub const CLIENT_TYPE_MASK: Block = 0x3f;
