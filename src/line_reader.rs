use tokio::io::AsyncReadExt;

use crate::util::allocate_vec;

const DEFAULT_BUFFER_SIZE: usize = 32768;

/// Buffered CRLF line reader for HTTP request heads. The buffer size bounds
/// the maximum line length. Bytes read past the final consumed line can be
/// reclaimed with [`LineReader::take_remaining`], which matters for CONNECT
/// where pipelined tunnel bytes may already sit in the buffer.
pub struct LineReader {
    buf: Box<[u8]>,
    start_offset: usize,
    end_offset: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buf: allocate_vec(buffer_size).into_boxed_slice(),
            start_offset: 0,
            end_offset: 0,
        }
    }

    /// Seed already-consumed bytes back into the buffer, e.g. the byte used
    /// for protocol detection.
    pub fn prime(&mut self, data: &[u8]) {
        assert!(self.end_offset + data.len() <= self.buf.len());
        self.buf[self.end_offset..self.end_offset + data.len()].copy_from_slice(data);
        self.end_offset += data.len();
    }

    /// Read one line, stripping the trailing LF and optional CR.
    pub async fn read_line<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<String> {
        loop {
            if let Some(pos) = self.buf[self.start_offset..self.end_offset]
                .iter()
                .position(|&b| b == b'\n')
            {
                let newline_pos = self.start_offset + pos;
                let mut line_end = newline_pos;
                if line_end > self.start_offset && self.buf[line_end - 1] == b'\r' {
                    line_end -= 1;
                }
                let line = String::from_utf8_lossy(&self.buf[self.start_offset..line_end])
                    .into_owned();
                self.start_offset = newline_pos + 1;
                if self.start_offset == self.end_offset {
                    self.start_offset = 0;
                    self.end_offset = 0;
                }
                return Ok(line);
            }

            if self.start_offset > 0 {
                self.buf.copy_within(self.start_offset..self.end_offset, 0);
                self.end_offset -= self.start_offset;
                self.start_offset = 0;
            }
            if self.end_offset == self.buf.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Line too long",
                ));
            }

            let n = stream.read(&mut self.buf[self.end_offset..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF while reading line",
                ));
            }
            self.end_offset += n;
        }
    }

    /// Fill `out` from buffered bytes first, then the stream.
    pub async fn read_exact<T: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut T,
        out: &mut [u8],
    ) -> std::io::Result<()> {
        let buffered = self.end_offset - self.start_offset;
        let from_buf = std::cmp::min(buffered, out.len());
        out[..from_buf].copy_from_slice(&self.buf[self.start_offset..self.start_offset + from_buf]);
        self.start_offset += from_buf;
        if self.start_offset == self.end_offset {
            self.start_offset = 0;
            self.end_offset = 0;
        }
        if from_buf < out.len() {
            stream.read_exact(&mut out[from_buf..]).await?;
        }
        Ok(())
    }

    /// Buffered bytes beyond the last consumed line.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let remaining = self.buf[self.start_offset..self.end_offset].to_vec();
        self.start_offset = 0;
        self.end_offset = 0;
        remaining
    }
}
