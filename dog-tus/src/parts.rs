//! Turns an unbounded request body into fixed-size parts.
//!
//! A part is **intermediate** as soon as the buffer fills, **final** when the
//! body ended (possibly with zero bytes), and **error** when the body failed
//! mid-read. A body that ends exactly on a buffer boundary therefore yields
//! an empty final part after its last intermediate one.

use bytes::{Bytes, BytesMut};
use dog_blob::ByteStream;
use futures_util::StreamExt;

/// Owned fixed-capacity buffer, reused across the parts of one body.
#[derive(Debug)]
pub struct PartBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl PartBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    /// Copy as much of `data` as fits; returns the number of bytes taken.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    /// Hand out the buffered bytes and start over empty.
    pub fn take(&mut self) -> Bytes {
        let bytes = self.buf.split().freeze();
        self.buf.reserve(self.capacity);
        bytes
    }
}

/// One buffer's worth of the body
#[derive(Debug)]
pub enum Part {
    Intermediate(Bytes),
    Final(Bytes),
    Error { bytes: Bytes, error: std::io::Error },
}

impl Part {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Part::Intermediate(bytes) | Part::Final(bytes) | Part::Error { bytes, .. } => bytes,
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

/// Single-pass pull reader. Yields `None` forever after a final or error
/// part.
pub struct PartReader {
    stream: ByteStream,
    buffer: PartBuffer,
    pending: Option<Bytes>,
    done: bool,
}

impl PartReader {
    /// `buffer` may already hold bytes (a resumed spill object); they lead
    /// the first part.
    pub fn new(stream: ByteStream, buffer: PartBuffer) -> Self {
        Self {
            stream,
            buffer,
            pending: None,
            done: false,
        }
    }

    pub async fn next_part(&mut self) -> Option<Part> {
        if self.done {
            return None;
        }

        loop {
            if let Some(chunk) = self.pending.take() {
                let taken = self.buffer.fill(&chunk);
                if taken < chunk.len() {
                    self.pending = Some(chunk.slice(taken..));
                }
            }

            if self.buffer.is_full() {
                return Some(Part::Intermediate(self.buffer.take()));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.pending = Some(chunk),
                None => {
                    self.done = true;
                    return Some(Part::Final(self.buffer.take()));
                }
                Some(Err(error)) => {
                    self.done = true;
                    return Some(Part::Error {
                        bytes: self.buffer.take(),
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))))
    }

    async fn collect(mut reader: PartReader) -> Vec<(char, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(part) = reader.next_part().await {
            let tag = match &part {
                Part::Intermediate(_) => 'i',
                Part::Final(_) => 'f',
                Part::Error { .. } => 'e',
            };
            out.push((tag, part.bytes().to_vec()));
        }
        out
    }

    #[tokio::test]
    async fn splits_on_capacity() {
        let reader = PartReader::new(body(vec!["abc", "defg", "hi"]), PartBuffer::new(4));
        assert_eq!(
            collect(reader).await,
            vec![('i', b"abcd".to_vec()), ('i', b"efgh".to_vec()), ('f', b"i".to_vec())]
        );
    }

    #[tokio::test]
    async fn exact_multiple_ends_with_empty_final_part() {
        let reader = PartReader::new(body(vec!["abcd", "efgh"]), PartBuffer::new(4));
        assert_eq!(
            collect(reader).await,
            vec![('i', b"abcd".to_vec()), ('i', b"efgh".to_vec()), ('f', Vec::new())]
        );
    }

    #[tokio::test]
    async fn empty_body_is_one_empty_final_part() {
        let reader = PartReader::new(body(vec![]), PartBuffer::new(4));
        assert_eq!(collect(reader).await, vec![('f', Vec::new())]);
    }

    #[tokio::test]
    async fn prefilled_buffer_leads_first_part() {
        let mut buffer = PartBuffer::new(4);
        assert_eq!(buffer.fill(b"xy"), 2);
        let reader = PartReader::new(body(vec!["z", "", "w12"]), buffer);
        assert_eq!(
            collect(reader).await,
            vec![('i', b"xyzw".to_vec()), ('f', b"12".to_vec())]
        );
    }

    #[tokio::test]
    async fn stream_failure_yields_error_part_then_stops() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcdef")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"never")),
        ];
        let mut reader = PartReader::new(Box::pin(stream::iter(chunks)), PartBuffer::new(4));

        assert!(matches!(reader.next_part().await, Some(Part::Intermediate(b)) if &b[..] == b"abcd"));
        match reader.next_part().await {
            Some(Part::Error { bytes, error }) => {
                assert_eq!(&bytes[..], b"ef");
                assert_eq!(error.kind(), std::io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert!(reader.next_part().await.is_none());
    }

    #[test]
    fn buffer_fill_respects_capacity() {
        let mut buffer = PartBuffer::new(3);
        assert_eq!(buffer.fill(b"abcdef"), 3);
        assert!(buffer.is_full());
        assert_eq!(buffer.take(), Bytes::from_static(b"abc"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.remaining(), 3);
    }
}
