//! Lua commands executed by the Redis job store.
//!
//! Each state transition that touches more than one key runs as a single
//! script so Redis applies it atomically, whichever process sends it.

use redis::Script;

const LEASE: &str = include_str!("lease.lua");
const ACK: &str = include_str!("ack.lua");
const FAIL: &str = include_str!("fail.lua");
const RECLAIM: &str = include_str!("reclaim.lua");
const PROMOTE: &str = include_str!("promote.lua");
const COUNTS: &str = include_str!("counts.lua");

/// Loaded command scripts. `Script` sends EVALSHA and falls back to
/// loading the source when the server does not know the hash yet.
pub struct Commands {
    pub lease: Script,
    pub ack: Script,
    pub fail: Script,
    pub reclaim: Script,
    pub promote: Script,
    pub counts: Script,
}

impl Commands {
    pub fn new() -> Self {
        Commands {
            lease: Script::new(LEASE),
            ack: Script::new(ACK),
            fail: Script::new(FAIL),
            reclaim: Script::new(RECLAIM),
            promote: Script::new(PROMOTE),
            counts: Script::new(COUNTS),
        }
    }
}

impl Default for Commands {
    fn default() -> Self {
        Self::new()
    }
}
