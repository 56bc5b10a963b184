use std::{future::poll_fn, io, pin::Pin, task::Poll, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    time::sleep,
};

/// Read buffer of one connection.
///
/// Bytes are read from the socket in chunks and handed to the incremental
/// readers (signature, headers, body) through [`pending`](Self::pending) and
/// [`consume`](Self::consume). Leftovers survive across stages, which is what
/// lets one socket read span a stage boundary.
#[derive(Debug)]
pub(crate) struct Inbox {
    buffer: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Inbox {
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity.max(64)].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(data: &[u8]) -> Self {
        let mut inbox = Self::new(data.len());
        inbox.buffer[..data.len()].copy_from_slice(data);
        inbox.end = data.len();
        inbox
    }

    #[inline(always)]
    pub(crate) fn pending(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub(crate) fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Removes and returns everything buffered.
    pub(crate) fn take(&mut self) -> Vec<u8> {
        let data = self.pending().to_vec();
        self.consume(data.len());
        data
    }

    #[inline]
    fn make_room(&mut self) {
        if self.end == self.buffer.len() {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Reads once from `reader`, failing with `TimedOut` after `time`.
    ///
    /// Returns the number of new bytes; `0` means the peer closed.
    pub(crate) async fn fill<R>(&mut self, reader: &mut R, time: Duration) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.make_room();

        tokio::select! {
            biased;

            read_result = reader.read(&mut self.buffer[self.end..]) => {
                let n = read_result?;
                self.end += n;
                Ok(n)
            }
            _ = sleep(time) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout"))
            },
        }
    }

    /// Reads whatever `reader` has right now without waiting.
    ///
    /// `None` when nothing is available; the calling task is woken once it is.
    pub(crate) async fn try_fill<R>(&mut self, reader: &mut R) -> Option<io::Result<usize>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.make_room();

        let mut buf = ReadBuf::new(&mut self.buffer[self.end..]);
        let polled = poll_fn(|cx| Poll::Ready(Pin::new(&mut *reader).poll_read(cx, &mut buf))).await;

        match polled {
            Poll::Pending => None,
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len();
                self.end += n;
                Some(Ok(n))
            }
            Poll::Ready(Err(e)) => Some(Err(e)),
        }
    }
}
