//! AMI line protocol parsing

use crate::{
    constants::MAX_LINE_LENGTH,
    error::{BridgeError, BridgeResult},
    event::EventRecord,
};

/// Incremental AMI parser.
///
/// Bytes are fed with [`add_data`](Self::add_data) as they arrive; lines may
/// be split anywhere across reads. [`parse_record`](Self::parse_record)
/// accumulates `key:value` lines until a blank line and then yields the
/// record.
///
/// A line without a colon is consumed and reported as
/// [`BridgeError::MalformedLine`]; the record being accumulated keeps its
/// other fields, so callers may log the error and keep parsing.
#[derive(Debug, Default)]
pub struct AmiParser {
    buffer: Vec<u8>,
    current: EventRecord,
}

impl AmiParser {
    /// Create new parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Add data to the parser buffer.
    ///
    /// Fails if an unterminated line grows beyond [`MAX_LINE_LENGTH`].
    pub fn add_data(&mut self, data: &[u8]) -> BridgeResult<()> {
        self.buffer
            .extend_from_slice(data);

        let tail_start = self
            .buffer
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let tail_len = self.buffer.len() - tail_start;
        if tail_len > MAX_LINE_LENGTH {
            return Err(BridgeError::protocol(format!(
                "unterminated line of {} bytes exceeds limit {}",
                tail_len, MAX_LINE_LENGTH
            )));
        }
        Ok(())
    }

    /// Bytes received but not yet consumed as complete lines.
    pub fn buffered_len(&self) -> usize {
        self.buffer
            .len()
    }

    /// Take one complete line off the buffer, without its `\n` / `\r\n`.
    ///
    /// Returns `None` until a full line is available. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self
            .buffer
            .iter()
            .position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self
            .buffer
            .drain(..=end)
            .collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Try to complete a record from the buffered data.
    ///
    /// - `Ok(Some(record))`: a blank line closed a non-empty record
    /// - `Ok(None)`: no record yet, feed more data
    /// - `Err(MalformedLine)`: a line lacking a colon was skipped
    pub fn parse_record(&mut self) -> BridgeResult<Option<EventRecord>> {
        while let Some(line) = self.next_line() {
            if line
                .trim()
                .is_empty()
            {
                if self
                    .current
                    .is_empty()
                {
                    continue;
                }
                return Ok(Some(std::mem::take(&mut self.current)));
            }

            match line.split_once(':') {
                Some((key, value))
                    if !key
                        .trim()
                        .is_empty() =>
                {
                    self.current
                        .set_field(key.trim(), value.trim());
                }
                _ => return Err(BridgeError::MalformedLine { line }),
            }
        }
        Ok(None)
    }
}
