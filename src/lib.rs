//! Receiving side of a CD1.1-style framed transport for continuous waveform data: remote
//!  digitizing stations stream sequence-numbered DATA frames over long-lived TCP sessions that
//!  may stall, reconnect, or deliver frames out of order or duplicated. This crate tracks, per
//!  frame set, exactly which sequence numbers have and have not arrived, reports that gap state
//!  back to the sender so it can retransmit, and recovers safely when a sender resets its
//!  numbering.
//!
//! ## Design goals
//!
//! * No silent data loss: every sequence number that has not arrived is represented in exactly
//!   one gap interval until it either arrives or provably falls out of the sender's retained
//!   window.
//! * No false "filled" gaps: reconciliation against the sender's own reported envelope may only
//!   discard a gap when the sender can no longer serve it, never because of overlap ambiguity.
//! * Safe recovery from series resets: a change in the series identifier (or an irreconcilable
//!   peer envelope) invalidates all prior sequence bookkeeping, deliberately and loudly.
//! * The hosting process never dies because of this crate: all failure paths degrade to
//!   "drop this frame or this session and keep serving the others".
//! * External concerns stay external: the connection broker, the sample archival pipeline, the
//!   station registry, alarm routing and the exact wire checksum algorithm are all injected
//!   collaborators.
//!
//! ## Wire format
//!
//! All integers are big-endian.
//!
//! Frame layout:
//! ```ascii
//!  0: frame type (u32)
//!  4: total length (u32) - header plus payload, excluding the trailer
//!  8: creator identity (8 bytes, NUL padded)
//! 16: destination identity (8 bytes, NUL padded)
//! 24: sequence number (u64)
//! 32: series (u32) - generation id of the sequence numbering epoch
//! 36: payload (total length - 36 bytes, type specific)
//!  *: trailer: auth id (u32), auth size (u32), auth body (auth size bytes),
//!     checksum (u64, last eight bytes of the frame)
//! ```
//!
//! The checksum is computed over the complete frame image with the checksum field zeroed. The
//!  algorithm itself is pluggable (`checksum::FrameChecksum`); interoperability requires
//!  bit-exact agreement with the sender. Auth payloads are carried as opaque bytes and never
//!  interpreted here.
//!
//! DATA payload:
//! ```ascii
//!  0: channel count (u32)
//!  4: frame duration (u32, ms)
//!  8: nominal start time (20 ascii bytes, "YYYYDDD HH:MM:SS.MMM")
//! 28: channel table length (u32)
//! 32: channel table (10 bytes per channel, padded to 4)
//!  *: one length-prefixed subframe per channel (see `data_payload::Subframe`)
//! ```
//!
//! ACKNACK payload:
//! ```ascii
//!  0: frame set label (20 ascii bytes, "CREATOR:DEST")
//! 20: lowest sequence of the envelope (u64)
//! 28: highest sequence of the envelope (u64)
//! 36: gap count (u32)
//! 40: gap count x (low u64, high u64) - [low, high) intervals still missing
//! ```
//!
//! ## Session lifecycle
//!
//! An external broker performs the listen/accept handshake and routes each accepted socket,
//!  together with the decoded connection request frame, to the right session's
//!  `LinkSession::reopen`. The session answers with a connection response, then runs one reader
//!  task and one ack scheduler task sharing the session's gap list. A session has at most one
//!  live connection: a reopen fully stops the previous pair first. On teardown the scheduler
//!  sends a final ACKNACK followed by an ALERT so the peer learns definitively that
//!  retransmission should stop.
//!
//! Acknowledgments are sent on a fixed cadence, independent of data arrival, and only once the
//!  session is "armed" (a frame has been received, or a reopen proved the peer exists) - acking
//!  an uninitialized envelope would invite retransmission of garbage.

pub mod ack_scheduler;
pub mod checksum;
pub mod collaborators;
pub mod config;
pub mod control_messages;
pub mod data_payload;
pub mod frame;
pub mod frame_codec;
pub mod gap_list;
pub mod gap_snapshot;
pub mod link_session;
pub mod safe_converter;
pub mod sample_codec;
pub mod send_pipeline;
pub mod station_token;
pub mod wire_time;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
