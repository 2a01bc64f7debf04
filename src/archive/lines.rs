use std::io::{self, BufRead, Read};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line {line} exceeds {limit} bytes")]
    TooLong { line: u64, limit: usize },
    #[error("failed to read line {line}: {source}")]
    Io {
        line: u64,
        #[source]
        source: io::Error,
    },
}

/// Line reader that never buffers more than `max_line_bytes` plus a `\r\n`
/// terminator for a single line, however the input is shaped.
pub struct BoundedLines<R> {
    reader: R,
    max_line_bytes: usize,
    line: u64,
    buf: Vec<u8>,
}

impl<R: BufRead> BoundedLines<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            line: 0,
            buf: Vec::new(),
        }
    }

    /// 1-based number of the line most recently returned.
    pub fn line_number(&self) -> u64 {
        self.line
    }

    pub fn next_line(&mut self) -> Result<Option<&[u8]>, LineError> {
        self.buf.clear();
        let limit = self.max_line_bytes as u64 + 2;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .map_err(|source| LineError::Io {
                line: self.line + 1,
                source,
            })?;
        if read == 0 {
            return Ok(None);
        }
        self.line += 1;

        let mut end = self.buf.len();
        if self.buf.last() == Some(&b'\n') {
            end -= 1;
            if end > 0 && self.buf[end - 1] == b'\r' {
                end -= 1;
            }
        }
        if end > self.max_line_bytes {
            return Err(LineError::TooLong {
                line: self.line,
                limit: self.max_line_bytes,
            });
        }
        Ok(Some(&self.buf[..end]))
    }
}

/// Number of non-blank lines, enforcing the bound on every one.
pub fn count_lines<R: BufRead>(reader: R, max_line_bytes: usize) -> Result<u64, LineError> {
    let mut lines = BoundedLines::new(reader, max_line_bytes);
    let mut count = 0;
    while let Some(line) = lines.next_line()? {
        if !line.iter().all(u8::is_ascii_whitespace) {
            count += 1;
        }
    }
    Ok(count)
}
