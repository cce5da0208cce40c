//! SLIP framing, as used by the ESP serial bootloader protocol
//!
//! See <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html#low-level-protocol>

use std::io::{self, Read, Write};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Errors raised while decoding a frame
#[derive(Debug)]
pub enum SlipError {
    /// An escape byte was followed by something other than ESC_END/ESC_ESC,
    /// or the source ended inside a frame
    FramingError,
    /// The source ended before a frame started
    EndOfStream,
    /// The underlying reader failed
    ReadError(io::Error),
}

impl From<io::Error> for SlipError {
    fn from(err: io::Error) -> Self {
        SlipError::ReadError(err)
    }
}

/// Streaming encoder which SLIP-escapes everything written to it
///
/// The opening END byte is written on construction, the closing one by
/// [SlipEncoder::finish].
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    pub fn new(writer: &'a mut W) -> io::Result<Self> {
        let len = writer.write(&[END])?;
        Ok(Self { writer, len })
    }

    pub fn finish(mut self) -> io::Result<usize> {
        self.len += self.writer.write(&[END])?;
        Ok(self.len)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.len += self.writer.write(&[ESC, ESC_END])?;
                }
                ESC => {
                    self.len += self.writer.write(&[ESC, ESC_ESC])?;
                }
                _ => {
                    self.len += self.writer.write(&[*value])?;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Encode a complete frame into a fresh buffer
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    let mut encoder = SlipEncoder::new(&mut out).unwrap();
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap();
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Bytes before the opening END are ROM chatter, drop them
    Discard,
    Normal,
    Escape,
}

/// Stateless-across-frames SLIP decoder
///
/// One instance may decode any number of consecutive frames from the same
/// source. Garbage in front of the opening END byte is tolerated; empty
/// frames (two adjacent ENDs) are skipped.
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
    count: usize,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Discard,
            count: 0,
        }
    }

    /// Read one frame from `source`, appending the payload to `sink`
    ///
    /// Returns the number of payload bytes on success. The reader's own
    /// timeout bounds the call.
    pub fn decode<R: Read>(&mut self, source: &mut R, sink: &mut Vec<u8>) -> Result<usize, SlipError> {
        let mut byte = [0u8; 1];

        loop {
            let read = source.read(&mut byte)?;
            if read == 0 {
                // EOF between frames is a clean end; EOF with a frame
                // half-collected (or a dangling escape) is not
                let err = if self.count == 0 && self.state != State::Escape {
                    SlipError::EndOfStream
                } else {
                    SlipError::FramingError
                };
                self.reset();
                return Err(err);
            }

            let value = byte[0];
            match self.state {
                State::Discard => {
                    if value == END {
                        self.state = State::Normal;
                        self.count = 0;
                    }
                }
                State::Normal => match value {
                    END => {
                        if self.count > 0 {
                            let len = self.count;
                            // Stay in Normal: the next frame may follow
                            // back to back without a fresh opening END.
                            self.count = 0;
                            return Ok(len);
                        }
                    }
                    ESC => {
                        self.state = State::Escape;
                    }
                    _ => {
                        sink.push(value);
                        self.count += 1;
                    }
                },
                State::Escape => match value {
                    ESC_END => {
                        sink.push(END);
                        self.count += 1;
                        self.state = State::Normal;
                    }
                    ESC_ESC => {
                        sink.push(ESC);
                        self.count += 1;
                        self.state = State::Normal;
                    }
                    _ => {
                        self.reset();
                        return Err(SlipError::FramingError);
                    }
                },
            }
        }
    }

    /// Drop any half-collected frame state, e.g. after a read timeout
    pub fn reset(&mut self) {
        self.state = State::Discard;
        self.count = 0;
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode every frame contained in `data`
pub fn decode_all(data: &[u8]) -> Result<Vec<Vec<u8>>, SlipError> {
    let mut source = data;
    let mut decoder = SlipDecoder::new();
    let mut frames = Vec::new();

    loop {
        let mut frame = Vec::new();
        match decoder.decode(&mut source, &mut frame) {
            Ok(_) => frames.push(frame),
            Err(SlipError::EndOfStream) => return Ok(frames),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_end_and_esc() {
        let encoded = encode(&[0xC0, 0xDB, 0x00, 0xFF]);
        assert_eq!(
            encoded,
            &[0xC0, 0xDB, 0xDC, 0xDB, 0xDD, 0x00, 0xFF, 0xC0]
        );
    }

    #[test]
    fn round_trip() {
        let data = [0xC0, 0xDB, 0x00, 0xFF];
        let encoded = encode(&data);

        let mut decoder = SlipDecoder::new();
        let mut out = Vec::new();
        let len = decoder.decode(&mut encoded.as_slice(), &mut out).unwrap();
        assert_eq!(len, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn concatenated_frames_decode_without_residue() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(&[0x01, 0x02]));
        stream.extend_from_slice(&encode(&[0xC0]));
        stream.extend_from_slice(&encode(&[0x03]));

        let frames = decode_all(&stream).unwrap();
        assert_eq!(frames, vec![vec![0x01, 0x02], vec![0xC0], vec![0x03]]);
    }

    #[test]
    fn leading_garbage_is_dropped() {
        let mut stream = b"ets Jul 29 2019 12:21:46\r\n".to_vec();
        stream.extend_from_slice(&encode(&[0xAA, 0xBB]));

        let frames = decode_all(&stream).unwrap();
        assert_eq!(frames, vec![vec![0xAA, 0xBB]]);
    }

    #[test]
    fn dangling_escape_is_a_framing_error() {
        let stream = [END, 0x01, ESC];

        let mut decoder = SlipDecoder::new();
        let mut out = Vec::new();
        let err = decoder.decode(&mut stream.as_slice(), &mut out).unwrap_err();
        assert!(matches!(err, SlipError::FramingError));
    }

    #[test]
    fn invalid_escape_is_a_framing_error() {
        let stream = [END, ESC, 0x42, END];

        let mut decoder = SlipDecoder::new();
        let mut out = Vec::new();
        let err = decoder.decode(&mut stream.as_slice(), &mut out).unwrap_err();
        assert!(matches!(err, SlipError::FramingError));
    }

    #[test]
    fn silent_source_is_end_of_stream() {
        let mut decoder = SlipDecoder::new();
        let mut out = Vec::new();
        let err = decoder.decode(&mut [].as_slice(), &mut out).unwrap_err();
        assert!(matches!(err, SlipError::EndOfStream));
    }
}
