//! Shared protocol constants for the fleetsync framed RPC transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FLSY";
pub const VERSION: u16 = 1;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
// A WRITE_AT request carries one chunk plus a small envelope
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Default listener port for fleetd
pub const DEFAULT_PORT: u16 = 9032;

/// Default chunk budget for large-file transfers (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default cap on in-flight chunk writes per file
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// mDNS service type advertised by nodes
pub const MDNS_SERVICE_TYPE: &str = "_fleetsync._tcp.local.";

// Frame type IDs (keep numeric stable)
pub mod frame {
    // Handshake:
    // Server sends: CHALLENGE (nonce)
    // Client sends: AUTH (hex token)
    // Server responds: AUTH_OK, or AUTH_REJECT and closes
    pub const CHALLENGE: u8 = 1;
    pub const AUTH: u8 = 2;
    pub const AUTH_OK: u8 = 3;
    pub const AUTH_REJECT: u8 = 4;

    // Calls: REQUEST (bincode RequestEnvelope) -> RESPONSE (bincode ResponseEnvelope)
    // Responses may arrive in any order; the envelope id pairs them up
    pub const REQUEST: u8 = 10;
    pub const RESPONSE: u8 = 11;

    // Heartbeat
    pub const PING: u8 = 20;
    pub const PONG: u8 = 21;
}

/// Fixed identifiers of the services a node exposes
pub mod service {
    pub const FILE: u8 = 1;
    pub const PROCESS: u8 = 2;
    pub const SERVICE_CONTROL: u8 = 3;
    pub const REGISTRY: u8 = 4;
}

// Centralized timeout constants
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Challenge/response must complete within this window (ms)
    pub const HANDSHAKE_MS: u64 = 5_000;

    // Default heartbeat interval (s)
    pub const HEARTBEAT_SECS: u64 = 5;

    // A peer silent for this many heartbeat intervals is considered dead
    pub const DEAD_AFTER_BEATS: u32 = 4;

    // Base timeout for reading a frame payload once its header arrived (ms)
    pub const READ_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of payload (ms)
    pub const PER_MB_MS: u64 = 100;

    // Calculate read deadline based on payload size (ms)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_plus_envelope_fits_in_a_frame() {
        assert!(DEFAULT_CHUNK_SIZE + 64 * 1024 < MAX_FRAME_SIZE);
    }

    #[test]
    fn read_deadline_scales_with_payload() {
        assert_eq!(timeouts::read_deadline_ms(0), timeouts::READ_BASE_MS);
        assert_eq!(
            timeouts::read_deadline_ms(4 * 1024 * 1024),
            timeouts::READ_BASE_MS + 4 * timeouts::PER_MB_MS
        );
    }
}
