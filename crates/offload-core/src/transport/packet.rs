//! Packet framing for size-limited channels.
//!
//! A logical message is split into fragments of at most `max_fragment_size`
//! bytes. Only the first fragment is framed:
//!
//! ```text
//! [u32 BE: total length][payload ...]   first fragment
//! [payload ...]                          continuation fragments
//! ```
//!
//! A declared length of zero is an empty message, which higher layers use as
//! an explicit disconnect signal.

use crate::config::ProtocolConfig;
use crate::{ProviderError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

const LENGTH_PREFIX: usize = 4;

/// Split `data` into fragments with the default fragment size.
pub fn fragment(data: &[u8]) -> Result<Vec<Bytes>> {
    fragment_with_size(data, ProtocolConfig::MAX_FRAGMENT_SIZE)
}

/// Split `data` into fragments of at most `max_fragment_size` bytes.
pub fn fragment_with_size(data: &[u8], max_fragment_size: usize) -> Result<Vec<Bytes>> {
    if max_fragment_size < ProtocolConfig::MIN_FRAGMENT_SIZE {
        return Err(ProviderError::Config {
            message: format!(
                "Fragment size must be at least {} bytes, got {}",
                ProtocolConfig::MIN_FRAGMENT_SIZE,
                max_fragment_size
            ),
        });
    }
    if data.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(ProviderError::MessageTooLarge {
            length: data.len(),
            max: ProtocolConfig::MAX_MESSAGE_SIZE,
        });
    }

    let first_capacity = max_fragment_size - LENGTH_PREFIX;
    let head_len = data.len().min(first_capacity);

    let mut first = BytesMut::with_capacity(LENGTH_PREFIX + head_len);
    first.put_u32(data.len() as u32);
    first.put_slice(&data[..head_len]);

    let mut fragments = vec![first.freeze()];
    fragments.extend(
        data[head_len..]
            .chunks(max_fragment_size)
            .map(Bytes::copy_from_slice),
    );
    Ok(fragments)
}

/// Reassembly progress of one peer.
#[derive(Debug)]
enum DefragmentationState {
    /// No partial message; `header` collects a length prefix split across packets.
    WaitingForNewMessage { header: [u8; LENGTH_PREFIX], filled: usize },
    /// Accumulating the bytes of one declared message.
    WaitingForData {
        expected_length: usize,
        buffer: BytesMut,
    },
}

impl DefragmentationState {
    fn initial() -> Self {
        DefragmentationState::WaitingForNewMessage {
            header: [0; LENGTH_PREFIX],
            filled: 0,
        }
    }
}

/// Reassembles fragments from one remote peer into complete messages.
#[derive(Debug)]
pub struct PacketDefragmenter {
    state: DefragmentationState,
    completed: VecDeque<Bytes>,
    max_message_size: usize,
}

impl Default for PacketDefragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDefragmenter {
    pub fn new() -> Self {
        Self::with_limit(ProtocolConfig::MAX_MESSAGE_SIZE)
    }

    /// Create a defragmenter with a custom ceiling for declared lengths.
    pub fn with_limit(max_message_size: usize) -> Self {
        Self {
            state: DefragmentationState::initial(),
            completed: VecDeque::new(),
            max_message_size,
        }
    }

    /// Consume raw bytes in arrival order.
    ///
    /// One call may carry the tail of one message and the head of the next.
    /// A declared length above the ceiling is a protocol error; the state is
    /// reset and the peer should be dropped.
    pub fn process_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            match &mut self.state {
                DefragmentationState::WaitingForNewMessage { header, filled } => {
                    let take = (LENGTH_PREFIX - *filled).min(bytes.len());
                    header[*filled..*filled + take].copy_from_slice(&bytes[..take]);
                    *filled += take;
                    bytes = &bytes[take..];
                    if *filled < LENGTH_PREFIX {
                        break;
                    }

                    let expected_length = u32::from_be_bytes(*header) as usize;
                    if expected_length > self.max_message_size {
                        self.state = DefragmentationState::initial();
                        return Err(ProviderError::MessageTooLarge {
                            length: expected_length,
                            max: self.max_message_size,
                        });
                    }

                    if expected_length == 0 {
                        self.completed.push_back(Bytes::new());
                        self.state = DefragmentationState::initial();
                        continue;
                    }

                    self.state = DefragmentationState::WaitingForData {
                        expected_length,
                        buffer: BytesMut::with_capacity(
                            expected_length.min(ProtocolConfig::MAX_FRAGMENT_SIZE),
                        ),
                    };
                }
                DefragmentationState::WaitingForData {
                    expected_length,
                    buffer,
                } => {
                    let needed = *expected_length - buffer.len();
                    let take = needed.min(bytes.len());
                    buffer.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if buffer.len() == *expected_length {
                        let message = std::mem::take(buffer).freeze();
                        self.completed.push_back(message);
                        self.state = DefragmentationState::initial();
                    }
                }
            }
        }
        Ok(())
    }

    /// Take the next completed message, if any.
    pub fn next_message(&mut self) -> Option<Bytes> {
        self.completed.pop_front()
    }

    /// True while a message is partially received.
    pub fn is_partial(&self) -> bool {
        match &self.state {
            DefragmentationState::WaitingForNewMessage { filled, .. } => *filled > 0,
            DefragmentationState::WaitingForData { .. } => true,
        }
    }
}
