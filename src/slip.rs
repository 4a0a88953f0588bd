use crate::error::{Error, Result};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// SLIP-encode `payload` into `out`, terminated by a single END byte.
pub fn encode(payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(payload.len() + 1);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(END);
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Normal,
    Escaped,
    /// After a bad escape: drop everything up to the next END.
    Discard,
}

/// Incremental SLIP frame decoder.
pub struct Decoder {
    buf: Vec<u8>,
    state: State,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: State::Normal,
        }
    }

    /// Feed one byte; returns the decoded payload when a frame completes.
    ///
    /// An END with no buffered payload is treated as a stray delimiter and
    /// skipped. A malformed escape sequence fails the current frame; the
    /// decoder resynchronizes on the next END.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8>>> {
        match (self.state, byte) {
            (State::Discard, END) => {
                self.state = State::Normal;
                Ok(None)
            }
            (State::Discard, _) => Ok(None),
            (State::Normal, END) => {
                if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(&mut self.buf)))
                }
            }
            (State::Normal, ESC) => {
                self.state = State::Escaped;
                Ok(None)
            }
            (State::Normal, byte) => {
                self.buf.push(byte);
                Ok(None)
            }
            (State::Escaped, ESC_END) => {
                self.buf.push(END);
                self.state = State::Normal;
                Ok(None)
            }
            (State::Escaped, ESC_ESC) => {
                self.buf.push(ESC);
                self.state = State::Normal;
                Ok(None)
            }
            (State::Escaped, _) => {
                self.buf.clear();
                self.state = State::Discard;
                Err(Error::Framing("invalid escape sequence"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if let Ok(Some(frame)) = decoder.push(b) {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn round_trip() {
        let payloads: &[&[u8]] = &[
            &[0x60, 0x03, 0x01],
            &[END],
            &[ESC],
            &[ESC, END, ESC_END, ESC_ESC, 0x00],
            &[0u8; 300],
        ];
        for payload in payloads {
            let mut encoded = Vec::new();
            encode(payload, &mut encoded);
            let mut decoder = Decoder::new();
            let frames = decode_all(&mut decoder, &encoded);
            assert_eq!(frames, vec![payload.to_vec()]);
        }
    }

    #[test]
    fn escapes_reserved_bytes() {
        let mut encoded = Vec::new();
        encode(&[0x01, END, ESC], &mut encoded);
        assert_eq!(encoded, [0x01, ESC, ESC_END, ESC, ESC_ESC, END]);
    }

    #[test]
    fn stray_delimiters_are_skipped() {
        let mut encoded = vec![END, END];
        encode(&[1, 2, 3], &mut encoded);
        encoded.push(END);
        encode(&[4, 5], &mut encoded);

        let mut decoder = Decoder::new();
        let frames = decode_all(&mut decoder, &encoded);
        assert_eq!(frames, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[test]
    fn bad_escape_fails_frame_and_resyncs() {
        let mut decoder = Decoder::new();
        assert!(decoder.push(0x01).unwrap().is_none());
        assert!(decoder.push(ESC).unwrap().is_none());
        assert!(decoder.push(0x42).is_err());
        // garbage up to the next END is dropped
        assert!(decoder.push(0x99).unwrap().is_none());
        assert!(decoder.push(END).unwrap().is_none());
        // the following frame decodes normally
        let mut frames = Vec::new();
        for &b in &[0x0A, 0x0B, END] {
            if let Some(f) = decoder.push(b).unwrap() {
                frames.push(f);
            }
        }
        assert_eq!(frames, vec![vec![0x0A, 0x0B]]);
    }
}
