//! Framing of peer connections: length-delimited frames carrying
//! bincode-encoded [`PeerMessage`]s.

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_serde::formats::Bincode;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use crate::models::peer::PeerMessage;

/// Largest frame accepted from or sent to a peer.
pub const MAX_PEER_FRAME_LENGTH_IN_BYTES: usize = 32 * 1024 * 1024;

pub type PeerTransport<S> = SymmetricallyFramed<
    Framed<S, LengthDelimitedCodec>,
    PeerMessage,
    Bincode<PeerMessage, PeerMessage>,
>;

fn get_codec_rules() -> LengthDelimitedCodec {
    let mut codec_rules = LengthDelimitedCodec::new();
    codec_rules.set_max_frame_length(MAX_PEER_FRAME_LENGTH_IN_BYTES);
    codec_rules
}

/// Wrap a byte stream into a sink and stream of [`PeerMessage`]s.
pub fn frame<S>(stream: S) -> PeerTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length_delimited = Framed::new(stream, get_codec_rules());
    SymmetricallyFramed::new(length_delimited, SymmetricalBincode::default())
}

/// Encoded size of a message, for the byte counters.
pub fn serialized_size(message: &PeerMessage) -> u64 {
    bincode::serialized_size(message).unwrap_or_default()
}
