// boxel-common — pieces shared between the server and client-side tooling:
// block type constants, the wire protocol, and a few small primitives the
// simulation core is built on.

pub mod blocks;
pub mod clock;
pub mod gzip;
pub mod heap;
pub mod protocol;
