//! An in-process pipe whose writer can close it with an error.
//!
//! Used to stream a reassembled tar from a producer thread to the caller:
//! a failure in the producer reaches the reader as a read error rather than
//! a short stream.

use std::{
    io::{self, ErrorKind, Read, Write},
    sync::mpsc::{sync_channel, Receiver, SyncSender},
};

const PIPE_DEPTH: usize = 16;

enum Message {
    Data(Vec<u8>),
    Error(io::Error),
}

/// Read half of a [`pipe`].
pub struct PipeReader {
    rx: Receiver<Message>,
    current: Vec<u8>,
    offset: usize,
    done: bool,
}

/// Write half of a [`pipe`]. Dropping it closes the pipe cleanly.
pub struct PipeWriter {
    tx: SyncSender<Message>,
}

/// Create a connected reader/writer pair.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    (
        PipeReader {
            rx,
            current: Vec::new(),
            offset: 0,
            done: false,
        },
        PipeWriter { tx },
    )
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("buffered", &(self.current.len() - self.offset))
            .field("done", &self.done)
            .finish()
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

impl PipeWriter {
    /// Close the pipe so that the reader sees `err` after any buffered data.
    pub fn close_with_error(self, err: io::Error) {
        // reader already gone: nobody left to tell
        let _ = self.tx.send(Message::Error(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Message::Data(buf.to_vec()))
            .map_err(|_| io::Error::from(ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Message::Data(data)) => {
                    self.current = data;
                    self.offset = 0;
                }
                Ok(Message::Error(err)) => {
                    self.done = true;
                    return Err(err);
                }
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
