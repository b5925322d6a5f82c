use super::bitfield::Bitfield;

/// Largest `length` field we honour in a `Request` (BEP 3 clients drop peers
/// that ask for more).
pub const MAX_REQUEST_LENGTH: u32 = 1 << 17;

// A `Piece` reply for the largest honoured request: id + index + begin + block.
const MAX_MESSAGE_LENGTH: u32 = 9 + MAX_REQUEST_LENGTH;

const LENGTH_PREFIX: usize = 4;

/// A peer wire protocol message. Every parsed message is a fresh value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece: u32,
    },
    Bitfield(Bitfield),
    Request {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Port {
        port: u16,
    },
}

/// Posible message parsing errors.
///
/// `Incomplete` is not a failure: the caller keeps accumulating bytes and
/// retries. Every other variant is malformed input and the caller drops the
/// connection.
#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    Incomplete,
    UnknownId(u8),
    InvalidLength { id: u8, length: u32 },
    LengthTooLong(u32),
}

impl MessageError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, MessageError::Incomplete)
    }
}

impl Message {
    /// Parses the first complete message out of the buffer.
    ///
    /// On success returns the message and the number of consumed bytes so the
    /// caller can drain its receive buffer and parse the rest.
    pub fn parse_first(buffer: &[u8]) -> Result<(Message, usize), MessageError> {
        if buffer.len() < LENGTH_PREFIX {
            return Err(MessageError::Incomplete);
        }

        let length = read_u32(&buffer[0..4]);
        if length == 0 {
            return Ok((Message::KeepAlive, LENGTH_PREFIX));
        }
        if length > MAX_MESSAGE_LENGTH {
            return Err(MessageError::LengthTooLong(length));
        }

        let body = &buffer[LENGTH_PREFIX..];
        if (body.len() as u32) < length {
            return Err(MessageError::Incomplete);
        }

        let id = body[0];
        let payload = &body[1..length as usize];

        let message = match id {
            0 => {
                Self::expect_length(id, length, 1)?;
                Message::Choke
            }
            1 => {
                Self::expect_length(id, length, 1)?;
                Message::Unchoke
            }
            2 => {
                Self::expect_length(id, length, 1)?;
                Message::Interested
            }
            3 => {
                Self::expect_length(id, length, 1)?;
                Message::NotInterested
            }
            4 => {
                Self::expect_length(id, length, 5)?;
                Message::Have {
                    piece: read_u32(&payload[0..4]),
                }
            }
            5 => Message::Bitfield(Bitfield::new(payload.to_vec())),
            6 => {
                Self::expect_length(id, length, 13)?;
                Message::Request {
                    piece: read_u32(&payload[0..4]),
                    begin: read_u32(&payload[4..8]),
                    length: read_u32(&payload[8..12]),
                }
            }
            7 => {
                if length < 9 {
                    return Err(MessageError::InvalidLength { id, length });
                }
                Message::Piece {
                    piece: read_u32(&payload[0..4]),
                    begin: read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                }
            }
            8 => {
                Self::expect_length(id, length, 13)?;
                Message::Cancel {
                    piece: read_u32(&payload[0..4]),
                    begin: read_u32(&payload[4..8]),
                    length: read_u32(&payload[8..12]),
                }
            }
            9 => {
                Self::expect_length(id, length, 3)?;
                Message::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                }
            }
            _ => return Err(MessageError::UnknownId(id)),
        };

        Ok((message, LENGTH_PREFIX + length as usize))
    }

    /// Converts a `Message` to a byte array, framed with the 4-byte
    /// big-endian length prefix.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut body: Vec<u8> = vec![];

        match self {
            Message::KeepAlive => {}
            Message::Choke => body.push(0),
            Message::Unchoke => body.push(1),
            Message::Interested => body.push(2),
            Message::NotInterested => body.push(3),
            Message::Have { piece } => {
                body.push(4);
                body.extend(piece.to_be_bytes());
            }
            Message::Bitfield(bitfield) => {
                body.push(5);
                body.extend(bitfield.get_vec());
            }
            Message::Request {
                piece,
                begin,
                length,
            } => {
                body.push(6);
                body.extend(piece.to_be_bytes());
                body.extend(begin.to_be_bytes());
                body.extend(length.to_be_bytes());
            }
            Message::Piece {
                piece,
                begin,
                block,
            } => {
                body.push(7);
                body.extend(piece.to_be_bytes());
                body.extend(begin.to_be_bytes());
                body.extend(block);
            }
            Message::Cancel {
                piece,
                begin,
                length,
            } => {
                body.push(8);
                body.extend(piece.to_be_bytes());
                body.extend(begin.to_be_bytes());
                body.extend(length.to_be_bytes());
            }
            Message::Port { port } => {
                body.push(9);
                body.extend(port.to_be_bytes());
            }
        }

        let mut bytes = Vec::with_capacity(LENGTH_PREFIX + body.len());
        bytes.extend((body.len() as u32).to_be_bytes());
        bytes.extend(body);
        bytes
    }

    fn expect_length(id: u8, length: u32, expected: u32) -> Result<(), MessageError> {
        if length != expected {
            return Err(MessageError::InvalidLength { id, length });
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf: [u8; 4] = [0; 4];
    buf.copy_from_slice(&bytes[0..4]);
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_message() {
        for message in create_test_messages() {
            let bytes = message.as_bytes();
            let (parsed, consumed) = Message::parse_first(&bytes).unwrap();

            assert_eq!(parsed, message);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_round_trip_leaves_trailing_bytes() {
        for message in create_test_messages() {
            let mut bytes = message.as_bytes();
            let junk = [0xde, 0xad, 0xbe, 0xef];
            bytes.extend(junk);

            let (parsed, consumed) = Message::parse_first(&bytes).unwrap();

            assert_eq!(parsed, message);
            assert_eq!(&bytes[consumed..], junk);
        }
    }

    #[test]
    fn test_every_truncation_is_incomplete() {
        for message in create_test_messages() {
            let bytes = message.as_bytes();
            for cut in 0..bytes.len() {
                let result = Message::parse_first(&bytes[..cut]);
                assert_eq!(result.unwrap_err(), MessageError::Incomplete);
            }
        }
    }

    #[test]
    fn test_keep_alive_is_four_zero_bytes() {
        let bytes = Message::KeepAlive.as_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0]);

        let (parsed, consumed) = Message::parse_first(&bytes).unwrap();
        assert_eq!(parsed, Message::KeepAlive);
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_message_request_as_bytes() {
        let message = Message::Request {
            piece: 0,
            begin: 0,
            length: 16384,
        };

        let bytes = message.as_bytes();

        let len = 13u32.to_be_bytes();
        let msg_type = 6u8.to_be_bytes();
        let mut expected = vec![];
        expected.extend(&len);
        expected.extend(&msg_type);
        expected.extend(0u32.to_be_bytes());
        expected.extend(0u32.to_be_bytes());
        expected.extend(16384u32.to_be_bytes());

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_message_interested_as_bytes() {
        let bytes = Message::Interested.as_bytes();

        let len = 1u32.to_be_bytes();
        let msg_type = 2u8.to_be_bytes();
        let mut expected = vec![];
        expected.extend(&len);
        expected.extend(&msg_type);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_unknown_id_is_malformed() {
        let bytes = [0, 0, 0, 1, 42];

        let result = Message::parse_first(&bytes);

        assert_eq!(result.unwrap_err(), MessageError::UnknownId(42));
    }

    #[test]
    fn test_flag_message_with_payload_is_malformed() {
        // A Choke carrying a body byte.
        let bytes = [0, 0, 0, 2, 0, 99];

        let result = Message::parse_first(&bytes);

        assert_eq!(
            result.unwrap_err(),
            MessageError::InvalidLength { id: 0, length: 2 }
        );
    }

    #[test]
    fn test_short_request_is_malformed() {
        let bytes = [0, 0, 0, 5, 6, 0, 0, 0, 0];

        let result = Message::parse_first(&bytes);

        assert_eq!(
            result.unwrap_err(),
            MessageError::InvalidLength { id: 6, length: 5 }
        );
    }

    #[test]
    fn test_piece_shorter_than_header_is_malformed() {
        let bytes = [0, 0, 0, 5, 7, 0, 0, 0, 0];

        let result = Message::parse_first(&bytes);

        assert_eq!(
            result.unwrap_err(),
            MessageError::InvalidLength { id: 7, length: 5 }
        );
    }

    #[test]
    fn test_oversized_length_prefix_is_malformed() {
        let length = MAX_MESSAGE_LENGTH + 1;
        let mut bytes = vec![];
        bytes.extend(length.to_be_bytes());
        bytes.push(7);

        let result = Message::parse_first(&bytes);

        assert_eq!(result.unwrap_err(), MessageError::LengthTooLong(length));
    }

    #[test]
    fn test_parse_two_consecutive_messages() {
        let mut bytes = Message::Unchoke.as_bytes();
        bytes.extend(Message::Have { piece: 7 }.as_bytes());

        let (first, consumed) = Message::parse_first(&bytes).unwrap();
        let (second, _) = Message::parse_first(&bytes[consumed..]).unwrap();

        assert_eq!(first, Message::Unchoke);
        assert_eq!(second, Message::Have { piece: 7 });
    }

    // Auxiliary functions

    fn create_test_messages() -> Vec<Message> {
        vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece: 1302 },
            Message::Bitfield(Bitfield::new(vec![0b10110000, 0b00000001])),
            Message::Request {
                piece: 3,
                begin: 16384,
                length: 16384,
            },
            Message::Piece {
                piece: 3,
                begin: 16384,
                block: vec![0xab; 4000],
            },
            Message::Cancel {
                piece: 3,
                begin: 16384,
                length: 16384,
            },
            Message::Port { port: 6889 },
        ]
    }
}
