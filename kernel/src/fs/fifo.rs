//! In-memory pipes at the `fifo:` prefix.
//!
//! A FIFO is a locked list of heap-allocated payload blocks plus a list of
//! parked read requests. Writes push a block and then drain as many
//! (payload, reader) pairs as possible, completing each reader with the
//! copied prefix of its buffer; a block longer than the reader's buffer
//! keeps its remainder at the head for the next read. Parked reads are
//! cancellable until a writer claims them.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{
    CloseRequest, FileNameOps, FileOps, FileParam, IoBuffer, OpenFileMode, OpenRequest,
    OpenedFile, ParamRequest, RwRequest,
};
use crate::io::IoHandle;
use crate::spinlock::SpinLock;

struct Payload {
    data: Box<[u8]>,
    consumed: usize,
}

struct ParkedRead {
    request: RwRequest,
    buffer: IoBuffer,
}

struct FifoInner {
    payloads: VecDeque<Payload>,
    readers: Vec<ParkedRead>,
}

pub struct FifoFile {
    inner: SpinLock<FifoInner>,
}

impl FifoFile {
    fn new() -> Arc<FifoFile> {
        Arc::new(FifoFile {
            inner: SpinLock::new(FifoInner {
                payloads: VecDeque::new(),
                readers: Vec::new(),
            }),
        })
    }

    fn unpark(argument: usize, handle: IoHandle) {
        // the request owner is cancelling; its entry may already be gone if
        // a writer claimed it first
        let fifo = unsafe { &*(argument as *const FifoFile) };
        let mut inner = fifo.inner.lock();
        inner.readers.retain(|parked| parked.request.handle() != handle);
    }

    /// Match payloads against parked readers until one side runs dry.
    fn drain(&self) {
        loop {
            let (request, buffer, chunk) = {
                let mut inner = self.inner.lock();
                if inner.payloads.is_empty() || inner.readers.is_empty() {
                    return;
                }
                let parked = inner.readers.remove(0);
                if !parked.request.claim() {
                    // a concurrent cancel owns this reader now
                    continue;
                }
                let payload = inner.payloads.front_mut().unwrap();
                let remaining = payload.data.len() - payload.consumed;
                let take = remaining.min(parked.buffer.len());
                let mut chunk = Vec::with_capacity(take);
                chunk.extend_from_slice(&payload.data[payload.consumed..payload.consumed + take]);
                payload.consumed += take;
                if payload.consumed == payload.data.len() {
                    inner.payloads.pop_front();
                }
                (parked.request, parked.buffer, chunk)
            };
            // SAFETY: the reader's buffer is valid until its request
            // completes, which happens right here
            let copied = unsafe { buffer.fill_from(&chunk) };
            request.complete(copied, 0);
        }
    }

    /// Push one block without going through a file handle; producers inside
    /// the kernel (the console line buffer) use this.
    pub fn write_direct(&self, data: &[u8]) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.payloads.push_back(Payload {
                data: data.into(),
                consumed: 0,
            });
        }
        self.drain();
        true
    }
}

impl FileOps for FifoFile {
    fn read(&self, req: RwRequest, _file: &OpenedFile, buffer: IoBuffer) -> bool {
        req.park_cancellable(FifoFile::unpark, self as *const FifoFile as usize);
        self.inner.lock().readers.push(ParkedRead {
            request: req,
            buffer,
        });
        self.drain();
        true
    }

    fn write(&self, req: RwRequest, _file: &OpenedFile, buffer: IoBuffer) -> bool {
        let mut data = alloc::vec![0u8; buffer.len()];
        // SAFETY: the writer's buffer is valid for the duration of the verb
        let copied = unsafe { buffer.read_into(&mut data) };
        self.write_direct(&data[..copied]);
        req.complete(copied, 0);
        true
    }

    fn get_parameter(&self, req: ParamRequest, _file: &OpenedFile, code: FileParam) -> bool {
        match code {
            FileParam::FileInstance => {
                req.complete_u64(self as *const FifoFile as usize as u64);
                true
            }
            _ => false,
        }
    }

    fn close(&self, req: CloseRequest, _file: &OpenedFile) {
        let mut inner = self.inner.lock();
        // in-flight reads have completed or been cancelled by now
        assert!(inner.readers.is_empty(), "closing a FIFO with parked readers");
        inner.payloads.clear();
        drop(inner);
        req.complete();
    }
}

struct FifoProvider;

impl FileNameOps for FifoProvider {
    fn open(&self, req: OpenRequest, path: &[u8], mode: OpenFileMode) -> bool {
        // a FIFO has no subpath and must be opened for writing
        if !path.is_empty() || !mode.contains(OpenFileMode::WRITABLE) {
            return false;
        }
        req.complete(FifoFile::new());
        true
    }
}

pub fn init() {
    super::register_file_system(b"fifo", Arc::new(FifoProvider))
        .expect("cannot register the FIFO file system");
}

/// Open a fresh FIFO; non-blocking.
pub fn open_fifo_sync() -> Option<IoHandle> {
    super::open_sync(b"fifo:", OpenFileMode::WRITABLE)
}

#[cfg(test)]
mod tests {
    use super::super::{close_file, close_sync, open_file, read_file, read_sync, write_sync};
    use super::*;
    use crate::io::{self, IO_REQUEST_FAILURE};
    use crate::task::scheduler;

    fn ensure_fifo() {
        scheduler::ensure_bootstrap_task();
        let _ = super::super::register_file_system(b"fifo", Arc::new(FifoProvider));
    }

    #[test]
    fn open_requires_writable_and_empty_path() {
        ensure_fifo();
        assert_eq!(
            open_file(b"fifo:", OpenFileMode::empty()),
            IO_REQUEST_FAILURE
        );
        assert_eq!(
            open_file(b"fifo:sub", OpenFileMode::WRITABLE),
            IO_REQUEST_FAILURE
        );
        let handle = open_fifo_sync().unwrap();
        assert!(close_sync(handle));
    }

    #[test]
    fn short_reads_keep_the_block_remainder() {
        ensure_fifo();
        let handle = open_fifo_sync().unwrap();
        assert_eq!(write_sync(handle, &mut *b"123".to_vec()), Some(3));
        assert_eq!(write_sync(handle, &mut *b"45".to_vec()), Some(2));

        let mut buffer = [0u8; 2];
        // first read takes the prefix of the first block
        assert_eq!(read_sync(handle, &mut buffer), Some(2));
        assert_eq!(&buffer, b"12");
        // the remainder comes before the second block
        buffer = [0; 2];
        assert_eq!(read_sync(handle, &mut buffer), Some(1));
        assert_eq!(buffer[0], b'3');
        buffer = [0; 2];
        assert_eq!(read_sync(handle, &mut buffer), Some(2));
        assert_eq!(&buffer, b"45");

        assert!(close_sync(handle));
    }

    #[test]
    fn parked_reads_complete_on_the_next_write() {
        ensure_fifo();
        let handle = open_fifo_sync().unwrap();
        let mut buffer = [0u8; 4];
        let request = read_file(handle, IoBuffer::from_slice(&mut buffer));
        assert_ne!(request, IO_REQUEST_FAILURE);
        // nothing written yet: still pending
        let task = scheduler::current_task();
        assert_eq!(task.io.lock().completed_count(), 0);

        assert_eq!(write_sync(handle, &mut *b"ping".to_vec()), Some(4));
        let (values, count) = io::wait_io(request).unwrap();
        assert_eq!(count, 1);
        assert_eq!(values[0], 4);
        assert_eq!(&buffer, b"ping");

        assert!(close_sync(handle));
    }

    #[test]
    fn parked_reads_are_cancellable() {
        ensure_fifo();
        let handle = open_fifo_sync().unwrap();
        let mut buffer = [0u8; 4];
        let request = read_file(handle, IoBuffer::from_slice(&mut buffer));
        assert_ne!(request, IO_REQUEST_FAILURE);
        assert!(io::cancel_io(request));
        // the reader is gone; a write just queues its block
        assert_eq!(write_sync(handle, &mut *b"left".to_vec()), Some(4));
        assert_eq!(buffer, [0u8; 4]);
        // cancel after the fact reports the race
        assert!(!io::cancel_io(request));
        assert!(close_sync(handle));
    }

    #[test]
    fn close_with_a_parked_read_is_refused_until_cancelled() {
        ensure_fifo();
        let handle = open_fifo_sync().unwrap();
        let mut buffer = [0u8; 4];
        let request = read_file(handle, IoBuffer::from_slice(&mut buffer));
        // the read charges the file's outstanding-IO count
        assert_eq!(close_file(handle), IO_REQUEST_FAILURE);
        assert!(io::cancel_io(request));
        assert!(close_sync(handle));
    }
}
