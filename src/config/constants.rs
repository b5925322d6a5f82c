pub const MAX_PEERS: &str = "MAX_PEERS";
pub const LISTEN_PORT_START: &str = "LISTEN_PORT_START";
pub const LISTEN_PORT_END: &str = "LISTEN_PORT_END";
pub const BLACKLIST_FILE: &str = "BLACKLIST_FILE";

pub const MIN_SETTINGS: u32 = 3;
