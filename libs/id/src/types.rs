//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Relay Sessions
// =============================================================================

// One handshake relay, from ClientHello arrival to handoff or eviction.
// Shared by the edge and the bridge over the control surface.
define_id!(SessionId, "sess");

// One accepted client connection on the edge listener. Used for log
// correlation only; never crosses the control surface.
define_id!(ConnectionId, "conn");

// =============================================================================
// Tests
// =============================================================================
