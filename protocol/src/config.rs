//! # Protocol Configuration & Constants
//!
//! Every magic number in DUET lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these values are baked into deployed relays and persisted
//! sessions, so changing them after peers are in the wild ranges from
//! "annoying" to "channel-corrupting". Choose wisely.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Identity
// ---------------------------------------------------------------------------

/// Protocol magic tag carried in relay hello frames so a relay can quickly
/// reject non-DUET traffic without parsing further.
pub const PROTOCOL_MAGIC: u32 = 0x44554554; // "DUET" in ASCII hex. Yes, we're that cute.

/// Wire protocol version for channel messages. Bumped on any change to the
/// command set or payload shapes — peers on different wire versions must
/// not attempt to co-sign anything.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// The full crate version string, assembled at compile time so we don't
/// allocate for something this trivial at runtime.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Peer Discovery
// ---------------------------------------------------------------------------

/// Number of candidate slots probed when looking for counterparties:
/// `{room}-0` through `{room}-{PEER_PROBE_WINDOW - 1}`. A room only ever
/// has two live parties, but stale claims linger on the relay for a while,
/// so we probe a few extra slots.
pub const PEER_PROBE_WINDOW: u32 = 5;

/// How often the discovery loop re-dials unconnected candidate slots.
/// Peers routinely start minutes apart; rediscovery is the recovery path
/// for every "peer not there yet" failure.
pub const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between reconnect attempts after the signaling connection drops.
/// Open peer connections are kept; only the relay link is re-established.
pub const SIGNALING_RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Handshake Timing
// ---------------------------------------------------------------------------

/// Deadline for a counterparty to answer an in-flight signing exchange.
/// When it expires, the exchange fails with `HandshakeTimeout` and the
/// persisted channel state stays at its pre-handshake value.
///
/// 30 seconds is generous: the counter-signature itself is milliseconds of
/// work, the budget is for a human-speed peer on a bad connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Seed & Address Parameters
// ---------------------------------------------------------------------------

/// Length of a channel seed in characters.
pub const SEED_LENGTH: usize = 81;

/// Alphabet a channel seed is drawn from. Fixed by the ledger's key
/// derivation; not negotiable per channel.
pub const SEED_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ9876543210qwertyuiopasdfghjklzxcvbnm";

/// Human-readable prefix for rendered settlement addresses.
pub const ADDRESS_HRP: &str = "duet";

// ---------------------------------------------------------------------------
// Channel Limits
// ---------------------------------------------------------------------------

/// Default cap on the number of transactions a channel is provisioned for
/// when the caller doesn't specify one.
pub const DEFAULT_TX_COUNT_LIMIT: u32 = 100;

/// Ceiling on `tx_count_limit` at room creation. Each provisioned
/// transaction costs address-tree depth, and past this point channel
/// open/close times get ugly.
pub const MAX_TX_COUNT_LIMIT: u32 = 10_000;

// ---------------------------------------------------------------------------
// Network Defaults
// ---------------------------------------------------------------------------

/// Default TCP port for the signaling relay.
pub const DEFAULT_RELAY_PORT: u16 = 9630;

/// Default port for the node's Prometheus metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9631;

/// Upper bound on a single relay frame in bytes. A full channel state with
/// a maxed-out bundle list fits comfortably; anything larger is a peer
/// misbehaving and gets the connection dropped.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Event Loop Capacities
// ---------------------------------------------------------------------------

/// Capacity of the per-session event queue (transport events + local
/// intents). A bilateral channel produces single-digit messages per
/// handshake; 64 absorbs any realistic burst.
pub const SESSION_EVENT_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_magic_is_valid_ascii() {
        // The magic bytes should decode to a readable 4-char ASCII tag.
        let bytes = PROTOCOL_MAGIC.to_be_bytes();
        assert!(bytes.iter().all(|b| b.is_ascii_alphanumeric()));
        assert_eq!(&bytes, b"DUET");
    }

    #[test]
    fn seed_alphabet_has_no_duplicates() {
        // A duplicated character would bias seed generation toward it.
        let mut seen = [false; 256];
        for &b in SEED_ALPHABET {
            assert!(!seen[b as usize], "duplicate {:?} in seed alphabet", b as char);
            seen[b as usize] = true;
        }
    }

    #[test]
    fn probe_window_covers_both_parties() {
        // Two live peers plus room for stale claims.
        assert!(PEER_PROBE_WINDOW >= 2);
    }

    #[test]
    fn timing_constants_sanity() {
        // Rediscovery must tick several times inside one handshake window,
        // otherwise a reconnecting peer can never beat the deadline.
        assert!(REDISCOVERY_INTERVAL * 4 < HANDSHAKE_TIMEOUT);
        assert!(!HANDSHAKE_TIMEOUT.is_zero());
    }

    #[test]
    fn tx_limit_bounds() {
        assert!(DEFAULT_TX_COUNT_LIMIT > 0);
        assert!(u64::from(DEFAULT_TX_COUNT_LIMIT) <= u64::from(MAX_TX_COUNT_LIMIT));
    }
}
