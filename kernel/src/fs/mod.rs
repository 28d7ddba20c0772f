//! Virtual file system core.
//!
//! File-system providers register under a short prefix; `open` resolves
//! `<prefix>:<subpath>` to a provider and produces an open-file record whose
//! operation table serves every later verb. All verbs are asynchronous
//! IORequests; the synchronous wrappers below chain an immediate `wait_io`
//! for kernel tasks.
//!
//! The operation tables stay what they are in spirit — records of entry
//! points — expressed as trait objects so new providers can appear at
//! runtime.

pub mod fifo;

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::io::{self, IoHandle, IoObject, IoRequest, IO_REQUEST_FAILURE, MAX_IO_RETURNS};
use crate::spinlock::SpinLock;
use crate::syscall::{ReservedCall, SyscallContext, SyscallTable};

pub const MAX_PREFIX: usize = 8;
pub const MAX_FILE_ENUM_NAME: usize = 64;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct OpenFileMode: u32 {
        /// Open the container for enumeration instead of the file itself.
        const ENUMERATE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Typed parameter keys exposed by get/set-parameter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum FileParam {
    Size = 0x10,
    MaxWriteSize = 0x20,
    MinReadSize = 0x21,
    SourceAddress = 0x30,
    DestinationAddress = 0x31,
    SourcePort = 0x32,
    DestinationPort = 0x33,
    TransmitEtherType = 0x36,
    /// Opaque provider instance for in-process sharing.
    FileInstance = 0x50,
}

impl FileParam {
    pub fn from_code(code: u32) -> Option<FileParam> {
        Some(match code {
            0x10 => FileParam::Size,
            0x20 => FileParam::MaxWriteSize,
            0x21 => FileParam::MinReadSize,
            0x30 => FileParam::SourceAddress,
            0x31 => FileParam::DestinationAddress,
            0x32 => FileParam::SourcePort,
            0x33 => FileParam::DestinationPort,
            0x36 => FileParam::TransmitEtherType,
            0x50 => FileParam::FileInstance,
            _ => return None,
        })
    }
}

/// One directory-entry-sized record produced by enumeration reads.
#[derive(Clone, Copy)]
pub struct FileEnumeration {
    pub name_len: u32,
    pub name: [u8; MAX_FILE_ENUM_NAME],
    pub payload: EnumPayload,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EnumPayload {
    None,
    DiskPartition {
        partition_type: u8,
        start_lba: u64,
        sector_count: u64,
        sector_size: u32,
        disk_code: usize,
    },
    FileSystem {
        service: u32,
    },
    DataLink {
        address: u64,
    },
}

impl FileEnumeration {
    pub fn named(name: &[u8]) -> Self {
        assert!(name.len() <= MAX_FILE_ENUM_NAME);
        let mut record = Self {
            name_len: name.len() as u32,
            name: [0; MAX_FILE_ENUM_NAME],
            payload: EnumPayload::None,
        };
        record.name[..name.len()].copy_from_slice(name);
        record
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

/// ASCII wildcard match: `*` spans any run of characters.
pub fn match_wildcard(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => (0..=name.len()).any(|skip| match_wildcard(rest, &name[skip..])),
        Some((&literal, rest)) => {
            name.first() == Some(&literal) && match_wildcard(rest, &name[1..])
        }
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Caller memory handed to an asynchronous verb. The caller guarantees it
/// stays valid until the request completes or is cancelled.
#[derive(Clone, Copy)]
pub struct IoBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the buffer contract above; the VFS itself never aliases it.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the buffer's prefix; reports how much fit.
    ///
    /// # Safety
    ///
    /// The buffer contract: the underlying memory is still valid.
    pub unsafe fn fill_from(&self, data: &[u8]) -> usize {
        let count = data.len().min(self.len);
        core::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, count);
        count
    }

    /// # Safety
    ///
    /// The buffer contract: the underlying memory is still valid.
    pub unsafe fn read_into(&self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        core::ptr::copy_nonoverlapping(self.ptr, out.as_mut_ptr(), count);
        count
    }
}

// ---------------------------------------------------------------------------
// The open-file record
// ---------------------------------------------------------------------------

pub struct OpenedFile {
    ops: Arc<dyn FileOps>,
    mode: OpenFileMode,
    offset: AtomicU64,
    closing: AtomicBool,
    outstanding_io: AtomicU32,
}

impl OpenedFile {
    pub fn ops(&self) -> &Arc<dyn FileOps> {
        &self.ops
    }

    pub fn mode(&self) -> OpenFileMode {
        self.mode
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn advance_offset(&self, bytes: u64) {
        self.offset.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn outstanding_io(&self) -> u32 {
        self.outstanding_io.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Request records
// ---------------------------------------------------------------------------

type CancelHook = (fn(usize, IoHandle), usize);

struct FileIoState {
    returns: [usize; MAX_IO_RETURNS],
    return_count: usize,
    /// Driver-side removal callback, armed while the request sits in a
    /// driver queue.
    cancel_hook: Option<CancelHook>,
    /// The file this verb charges its outstanding-IO count to; taken on
    /// completion or cancellation, whichever comes first.
    charged_file: Option<Arc<OpenedFile>>,
}

/// The concrete IORequest behind every file verb.
pub struct FileIo {
    request: IoRequest,
    state: SpinLock<FileIoState>,
}

impl FileIo {
    fn new(charged_file: Option<Arc<OpenedFile>>) -> Arc<FileIo> {
        if let Some(file) = &charged_file {
            file.outstanding_io.fetch_add(1, Ordering::AcqRel);
        }
        Arc::new(FileIo {
            request: IoRequest::new(),
            state: SpinLock::new(FileIoState {
                returns: [0; MAX_IO_RETURNS],
                return_count: 0,
                cancel_hook: None,
                charged_file,
            }),
        })
    }

    fn as_io(self: &Arc<FileIo>) -> Arc<dyn IoObject> {
        self.clone()
    }

    fn discharge(state: &mut FileIoState) {
        if let Some(file) = state.charged_file.take() {
            file.outstanding_io.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn complete_with(self: &Arc<FileIo>, values: &[usize]) {
        {
            let mut state = self.state.lock();
            state.returns[..values.len()].copy_from_slice(values);
            state.return_count = values.len();
            state.cancel_hook = None;
            Self::discharge(&mut state);
        }
        io::complete(&self.as_io());
    }
}

impl IoObject for FileIo {
    fn request(&self) -> &IoRequest {
        &self.request
    }

    fn cancel(self: Arc<Self>) {
        let hook = {
            let mut state = self.state.lock();
            FileIo::discharge(&mut state);
            state.cancel_hook.take()
        };
        if let Some((hook, argument)) = hook {
            let handle = Arc::as_ptr(&self) as *const () as usize;
            hook(argument, handle);
        }
    }

    fn accept(self: Arc<Self>, returns: &mut [usize; MAX_IO_RETURNS]) -> usize {
        let state = self.state.lock();
        returns[..state.return_count].copy_from_slice(&state.returns[..state.return_count]);
        state.return_count
    }
}

/// Provider side of an `open` in flight.
pub struct OpenRequest {
    inner: Arc<FileIo>,
    mode: OpenFileMode,
}

impl OpenRequest {
    /// Produce the open-file record for `ops` and report its handle to the
    /// opener.
    pub fn complete(self, ops: Arc<dyn FileOps>) -> Arc<OpenedFile> {
        let file = Arc::new(OpenedFile {
            ops,
            mode: self.mode,
            offset: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            outstanding_io: AtomicU32::new(0),
        });
        let handle = open_files().register(file.clone());
        self.inner.complete_with(&[handle]);
        file
    }

    pub fn fail(self) {
        self.inner.complete_with(&[IO_REQUEST_FAILURE]);
    }
}

/// Provider side of a read/write in flight.
pub struct RwRequest {
    inner: Arc<FileIo>,
}

impl RwRequest {
    pub fn handle(&self) -> IoHandle {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Park the request in a driver queue: it becomes cancellable, and
    /// `hook(argument, handle)` will pull it back out if the task cancels.
    pub fn park_cancellable(&self, hook: fn(usize, IoHandle), argument: usize) {
        self.inner.state.lock().cancel_hook = Some((hook, argument));
        io::set_cancellable(&self.inner.as_io(), true);
    }

    /// Claim the request for completion; false when a cancel already won.
    pub fn claim(&self) -> bool {
        if io::claim_not_cancellable(&self.inner.as_io()) {
            self.inner.state.lock().cancel_hook = None;
            true
        } else {
            false
        }
    }

    /// Report `byte_count` transferred and advance the file offset by
    /// `add_offset`.
    pub fn complete(self, byte_count: usize, add_offset: u64) {
        if add_offset != 0 {
            let file = self.inner.state.lock().charged_file.clone();
            if let Some(file) = file {
                file.advance_offset(add_offset);
            }
        }
        self.inner.complete_with(&[byte_count]);
    }
}

/// Provider side of a parameter access in flight.
pub struct ParamRequest {
    inner: Arc<FileIo>,
}

impl ParamRequest {
    pub fn complete_u64(self, value: u64) {
        self.inner
            .complete_with(&[value as u32 as usize, (value >> 32) as u32 as usize]);
    }

    pub fn complete_empty(self) {
        self.inner.complete_with(&[]);
    }
}

/// Provider side of a close in flight.
pub struct CloseRequest {
    inner: Arc<FileIo>,
    handle: IoHandle,
}

impl CloseRequest {
    pub fn complete(self) {
        open_files().unregister(self.handle);
        self.inner.complete_with(&[]);
    }
}

// ---------------------------------------------------------------------------
// Provider traits
// ---------------------------------------------------------------------------

/// Per-provider open entry point, selected by path prefix.
pub trait FileNameOps: Send + Sync {
    /// Start an open of `path` (the part after the colon). Returning false
    /// aborts the request; otherwise the provider completes or fails `req`
    /// eventually.
    fn open(&self, req: OpenRequest, path: &[u8], mode: OpenFileMode) -> bool;
}

/// Per-file operation table. The implementor is the provider instance; the
/// defaults refuse, which surfaces as `IO_REQUEST_FAILURE` on the verb.
#[allow(unused_variables)]
pub trait FileOps: Send + Sync {
    fn read(&self, req: RwRequest, file: &OpenedFile, buffer: IoBuffer) -> bool {
        false
    }

    fn write(&self, req: RwRequest, file: &OpenedFile, buffer: IoBuffer) -> bool {
        false
    }

    fn seek_read(&self, req: RwRequest, file: &OpenedFile, buffer: IoBuffer, position: u64) -> bool {
        false
    }

    fn seek_write(
        &self,
        req: RwRequest,
        file: &OpenedFile,
        buffer: IoBuffer,
        position: u64,
    ) -> bool {
        false
    }

    fn get_parameter(&self, req: ParamRequest, file: &OpenedFile, code: FileParam) -> bool {
        false
    }

    fn set_parameter(
        &self,
        req: ParamRequest,
        file: &OpenedFile,
        code: FileParam,
        value: u64,
    ) -> bool {
        false
    }

    /// Tear the instance down. In-flight requests have completed or been
    /// cancelled by the time this runs.
    fn close(&self, req: CloseRequest, file: &OpenedFile) {
        req.complete();
    }
}

// ---------------------------------------------------------------------------
// Registry and open-file table
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterError {
    InvalidPrefix,
    PrefixExists,
}

struct Provider {
    prefix: [u8; MAX_PREFIX],
    prefix_len: usize,
    ops: Arc<dyn FileNameOps>,
}

static REGISTRY: OnceCell<SpinLock<Vec<Provider>>> = OnceCell::uninit();

fn registry() -> &'static SpinLock<Vec<Provider>> {
    REGISTRY.get_or_init(|| SpinLock::new(Vec::new()))
}

fn valid_prefix(prefix: &[u8]) -> bool {
    !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX
        && prefix
            .iter()
            .all(|&byte| byte.is_ascii_lowercase() || byte.is_ascii_digit())
}

/// Register a provider for `<prefix>:` paths.
pub fn register_file_system(
    prefix: &[u8],
    ops: Arc<dyn FileNameOps>,
) -> Result<(), RegisterError> {
    if !valid_prefix(prefix) {
        return Err(RegisterError::InvalidPrefix);
    }
    let mut providers = registry().lock();
    if providers
        .iter()
        .any(|provider| &provider.prefix[..provider.prefix_len] == prefix)
    {
        return Err(RegisterError::PrefixExists);
    }
    let mut stored = [0u8; MAX_PREFIX];
    stored[..prefix.len()].copy_from_slice(prefix);
    providers.push(Provider {
        prefix: stored,
        prefix_len: prefix.len(),
        ops,
    });
    log::info!(
        "file system {:?} registered",
        core::str::from_utf8(prefix).unwrap_or("?")
    );
    Ok(())
}

fn find_provider(prefix: &[u8]) -> Option<Arc<dyn FileNameOps>> {
    let providers = registry().lock();
    providers
        .iter()
        .find(|provider| &provider.prefix[..provider.prefix_len] == prefix)
        .map(|provider| provider.ops.clone())
}

struct OpenFileTable {
    files: SpinLock<Vec<Arc<OpenedFile>>>,
}

impl OpenFileTable {
    fn register(&self, file: Arc<OpenedFile>) -> IoHandle {
        let handle = Arc::as_ptr(&file) as *const () as usize;
        self.files.lock().push(file);
        handle
    }

    fn by_handle(&self, handle: IoHandle) -> Option<Arc<OpenedFile>> {
        let files = self.files.lock();
        files
            .iter()
            .find(|file| Arc::as_ptr(file) as *const () as usize == handle)
            .cloned()
    }

    fn unregister(&self, handle: IoHandle) {
        let mut files = self.files.lock();
        if let Some(index) = files
            .iter()
            .position(|file| Arc::as_ptr(file) as *const () as usize == handle)
        {
            files.swap_remove(index);
        }
    }
}

static OPEN_FILES: OnceCell<OpenFileTable> = OnceCell::uninit();

fn open_files() -> &'static OpenFileTable {
    OPEN_FILES.get_or_init(|| OpenFileTable {
        files: SpinLock::new(Vec::new()),
    })
}

// ---------------------------------------------------------------------------
// Verbs
// ---------------------------------------------------------------------------

fn abort_verb(inner: &Arc<FileIo>) {
    let task = crate::task::scheduler::current_task();
    let handle = Arc::as_ptr(inner) as *const () as usize;
    let _cancelled = io::try_cancel(&task, handle);
    debug_assert!(_cancelled, "aborting a verb that already left the pending list");
}

/// Start opening `<prefix>:<subpath>`. The returned request completes with
/// the file handle (or 0 on failure) as its single return value.
pub fn open_file(path: &[u8], mode: OpenFileMode) -> IoHandle {
    let colon = match path.iter().position(|&byte| byte == b':') {
        Some(colon) if colon <= MAX_PREFIX => colon,
        _ => return IO_REQUEST_FAILURE,
    };
    let provider = match find_provider(&path[..colon]) {
        Some(provider) => provider,
        None => return IO_REQUEST_FAILURE,
    };
    let inner = FileIo::new(None);
    let handle = io::pend(inner.as_io());
    let request = OpenRequest {
        inner: inner.clone(),
        mode,
    };
    if provider.open(request, &path[colon + 1..], mode) {
        handle
    } else {
        abort_verb(&inner);
        IO_REQUEST_FAILURE
    }
}

/// Look a handle up, refusing files already being closed.
fn live_file(handle: IoHandle) -> Option<Arc<OpenedFile>> {
    let file = open_files().by_handle(handle)?;
    if file.closing.load(Ordering::Acquire) {
        None
    } else {
        Some(file)
    }
}

fn rw_verb(
    handle: IoHandle,
    buffer: IoBuffer,
    dispatch: impl FnOnce(&Arc<dyn FileOps>, RwRequest, &OpenedFile, IoBuffer) -> bool,
) -> IoHandle {
    let file = match live_file(handle) {
        Some(file) => file,
        None => return IO_REQUEST_FAILURE,
    };
    let inner = FileIo::new(Some(file.clone()));
    let io_handle = io::pend(inner.as_io());
    let request = RwRequest {
        inner: inner.clone(),
    };
    let ops = file.ops.clone();
    if dispatch(&ops, request, &file, buffer) {
        io_handle
    } else {
        abort_verb(&inner);
        IO_REQUEST_FAILURE
    }
}

pub fn read_file(handle: IoHandle, buffer: IoBuffer) -> IoHandle {
    rw_verb(handle, buffer, |ops, req, file, buffer| {
        ops.read(req, file, buffer)
    })
}

pub fn write_file(handle: IoHandle, buffer: IoBuffer) -> IoHandle {
    rw_verb(handle, buffer, |ops, req, file, buffer| {
        ops.write(req, file, buffer)
    })
}

pub fn seek_read_file(handle: IoHandle, buffer: IoBuffer, position: u64) -> IoHandle {
    rw_verb(handle, buffer, |ops, req, file, buffer| {
        ops.seek_read(req, file, buffer, position)
    })
}

pub fn seek_write_file(handle: IoHandle, buffer: IoBuffer, position: u64) -> IoHandle {
    rw_verb(handle, buffer, |ops, req, file, buffer| {
        ops.seek_write(req, file, buffer, position)
    })
}

pub fn get_file_parameter(handle: IoHandle, code: u32) -> IoHandle {
    let code = match FileParam::from_code(code) {
        Some(code) => code,
        None => return IO_REQUEST_FAILURE,
    };
    let file = match live_file(handle) {
        Some(file) => file,
        None => return IO_REQUEST_FAILURE,
    };
    let inner = FileIo::new(Some(file.clone()));
    let io_handle = io::pend(inner.as_io());
    let request = ParamRequest {
        inner: inner.clone(),
    };
    let ops = file.ops.clone();
    if ops.get_parameter(request, &file, code) {
        io_handle
    } else {
        abort_verb(&inner);
        IO_REQUEST_FAILURE
    }
}

pub fn set_file_parameter(handle: IoHandle, code: u32, value: u64) -> IoHandle {
    let code = match FileParam::from_code(code) {
        Some(code) => code,
        None => return IO_REQUEST_FAILURE,
    };
    let file = match live_file(handle) {
        Some(file) => file,
        None => return IO_REQUEST_FAILURE,
    };
    let inner = FileIo::new(Some(file.clone()));
    let io_handle = io::pend(inner.as_io());
    let request = ParamRequest {
        inner: inner.clone(),
    };
    let ops = file.ops.clone();
    if ops.set_parameter(request, &file, code, value) {
        io_handle
    } else {
        abort_verb(&inner);
        IO_REQUEST_FAILURE
    }
}

/// Start closing a handle. A second close of the same handle — or a close
/// racing a verb still in flight — fails in-band.
pub fn close_file(handle: IoHandle) -> IoHandle {
    let file = match open_files().by_handle(handle) {
        Some(file) => file,
        None => return IO_REQUEST_FAILURE,
    };
    if file.closing.swap(true, Ordering::AcqRel) {
        return IO_REQUEST_FAILURE;
    }
    if file.outstanding_io.load(Ordering::Acquire) != 0 {
        file.closing.store(false, Ordering::Release);
        return IO_REQUEST_FAILURE;
    }
    let inner = FileIo::new(None);
    let io_handle = io::pend(inner.as_io());
    let request = CloseRequest {
        inner: inner.clone(),
        handle,
    };
    let ops = file.ops.clone();
    ops.close(request, &file);
    io_handle
}

// ---------------------------------------------------------------------------
// Synchronous wrappers for kernel tasks
// ---------------------------------------------------------------------------

pub fn open_sync(path: &[u8], mode: OpenFileMode) -> Option<IoHandle> {
    let request = open_file(path, mode);
    if request == IO_REQUEST_FAILURE {
        return None;
    }
    let (values, count) = io::wait_io(request)?;
    if count == 0 || values[0] == IO_REQUEST_FAILURE {
        None
    } else {
        Some(values[0])
    }
}

pub fn enumerate_sync(path: &[u8]) -> Option<IoHandle> {
    open_sync(path, OpenFileMode::ENUMERATE)
}

pub fn read_sync(handle: IoHandle, buffer: &mut [u8]) -> Option<usize> {
    let request = read_file(handle, IoBuffer::from_slice(buffer));
    if request == IO_REQUEST_FAILURE {
        return None;
    }
    let (values, count) = io::wait_io(request)?;
    (count > 0).then(|| values[0])
}

pub fn write_sync(handle: IoHandle, buffer: &mut [u8]) -> Option<usize> {
    let request = write_file(handle, IoBuffer::from_slice(buffer));
    if request == IO_REQUEST_FAILURE {
        return None;
    }
    let (values, count) = io::wait_io(request)?;
    (count > 0).then(|| values[0])
}

pub fn seek_read_sync(handle: IoHandle, buffer: &mut [u8], position: u64) -> Option<usize> {
    let request = seek_read_file(handle, IoBuffer::from_slice(buffer), position);
    if request == IO_REQUEST_FAILURE {
        return None;
    }
    let (values, count) = io::wait_io(request)?;
    (count > 0).then(|| values[0])
}

pub fn get_parameter_sync(handle: IoHandle, code: FileParam) -> Option<u64> {
    let request = get_file_parameter(handle, code as u32);
    if request == IO_REQUEST_FAILURE {
        return None;
    }
    let (values, count) = io::wait_io(request)?;
    (count >= 2).then(|| values[0] as u64 | ((values[1] as u64) << 32))
}

pub fn close_sync(handle: IoHandle) -> bool {
    let request = close_file(handle);
    if request == IO_REQUEST_FAILURE {
        return false;
    }
    io::wait_io(request).is_some()
}

// ---------------------------------------------------------------------------
// System-call surface
// ---------------------------------------------------------------------------

pub fn init(table: &SyscallTable) {
    table.register_reserved(ReservedCall::OpenFile, open_file_call, 0);
    table.register_reserved(ReservedCall::CloseFile, close_file_call, 0);
    table.register_reserved(ReservedCall::ReadFile, read_file_call, 0);
    table.register_reserved(ReservedCall::WriteFile, write_file_call, 0);
    table.register_reserved(ReservedCall::SeekReadFile, seek_read_file_call, 0);
    table.register_reserved(ReservedCall::SeekWriteFile, seek_write_file_call, 0);
    table.register_reserved(ReservedCall::GetFileParameter, get_file_parameter_call, 0);
    table.register_reserved(ReservedCall::SetFileParameter, set_file_parameter_call, 0);
}

fn open_file_call(ctx: &mut SyscallContext) {
    let path = unsafe {
        core::slice::from_raw_parts(ctx.arguments[0] as *const u8, ctx.arguments[1])
    };
    let mode = OpenFileMode::from_bits_truncate(ctx.arguments[2] as u32);
    ctx.returns[0] = open_file(path, mode);
}

fn close_file_call(ctx: &mut SyscallContext) {
    ctx.returns[0] = close_file(ctx.arguments[0]);
}

fn read_file_call(ctx: &mut SyscallContext) {
    let buffer = IoBuffer::new(ctx.arguments[1] as *mut u8, ctx.arguments[2]);
    ctx.returns[0] = read_file(ctx.arguments[0], buffer);
}

fn write_file_call(ctx: &mut SyscallContext) {
    let buffer = IoBuffer::new(ctx.arguments[1] as *mut u8, ctx.arguments[2]);
    ctx.returns[0] = write_file(ctx.arguments[0], buffer);
}

fn seek_read_file_call(ctx: &mut SyscallContext) {
    let buffer = IoBuffer::new(ctx.arguments[1] as *mut u8, ctx.arguments[4]);
    let position = ctx.arguments[2] as u64 | ((ctx.arguments[3] as u64) << 32);
    ctx.returns[0] = seek_read_file(ctx.arguments[0], buffer, position);
}

fn seek_write_file_call(ctx: &mut SyscallContext) {
    let buffer = IoBuffer::new(ctx.arguments[1] as *mut u8, ctx.arguments[4]);
    let position = ctx.arguments[2] as u64 | ((ctx.arguments[3] as u64) << 32);
    ctx.returns[0] = seek_write_file(ctx.arguments[0], buffer, position);
}

fn get_file_parameter_call(ctx: &mut SyscallContext) {
    ctx.returns[0] = get_file_parameter(ctx.arguments[0], ctx.arguments[1] as u32);
}

fn set_file_parameter_call(ctx: &mut SyscallContext) {
    let value = ctx.arguments[2] as u64 | ((ctx.arguments[3] as u64) << 32);
    ctx.returns[0] = set_file_parameter(ctx.arguments[0], ctx.arguments[1] as u32, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler;

    struct EchoFile;

    impl FileOps for EchoFile {
        fn read(&self, req: RwRequest, _file: &OpenedFile, buffer: IoBuffer) -> bool {
            let written = unsafe { buffer.fill_from(b"echo") };
            req.complete(written, written as u64);
            true
        }

        fn get_parameter(&self, req: ParamRequest, _file: &OpenedFile, code: FileParam) -> bool {
            match code {
                FileParam::Size => {
                    req.complete_u64(0x1_0000_0004);
                    true
                }
                _ => false,
            }
        }
    }

    struct EchoProvider;

    impl FileNameOps for EchoProvider {
        fn open(&self, req: OpenRequest, path: &[u8], _mode: OpenFileMode) -> bool {
            if path == b"missing" {
                return false;
            }
            req.complete(Arc::new(EchoFile));
            true
        }
    }

    fn ensure_provider() {
        scheduler::ensure_bootstrap_task();
        // several tests race to register; only the first wins
        let _ = register_file_system(b"echo0", Arc::new(EchoProvider));
    }

    #[test]
    fn prefix_validation_and_conflicts() {
        ensure_provider();
        assert_eq!(
            register_file_system(b"echo0", Arc::new(EchoProvider)),
            Err(RegisterError::PrefixExists)
        );
        assert_eq!(
            register_file_system(b"WAYTOOLONGPREFIX", Arc::new(EchoProvider)),
            Err(RegisterError::InvalidPrefix)
        );
        assert_eq!(
            register_file_system(b"", Arc::new(EchoProvider)),
            Err(RegisterError::InvalidPrefix)
        );
    }

    #[test]
    fn open_read_close_round_trip() {
        ensure_provider();
        let handle = open_sync(b"echo0:file", OpenFileMode::empty()).unwrap();
        let mut buffer = [0u8; 8];
        let read = read_sync(handle, &mut buffer).unwrap();
        assert_eq!(&buffer[..read], b"echo");
        // the rw completion advanced the offset
        let file = open_files().by_handle(handle).unwrap();
        assert_eq!(file.offset(), 4);
        drop(file);

        assert!(close_sync(handle));
        // repeated close: invalid argument, in-band
        assert_eq!(close_file(handle), IO_REQUEST_FAILURE);
        // verbs on a closed handle fail too
        assert!(read_sync(handle, &mut buffer).is_none());
    }

    #[test]
    fn open_failures_are_in_band() {
        ensure_provider();
        assert_eq!(
            open_file(b"nosuchfs:x", OpenFileMode::empty()),
            IO_REQUEST_FAILURE
        );
        assert_eq!(
            open_file(b"noprefixhere", OpenFileMode::empty()),
            IO_REQUEST_FAILURE
        );
        // provider refusal unwinds the pended request
        assert!(open_sync(b"echo0:missing", OpenFileMode::empty()).is_none());
        let task = scheduler::current_task();
        assert_eq!(task.io.lock().pending_count(), 0);
    }

    #[test]
    fn typed_parameters_round_trip() {
        ensure_provider();
        let handle = open_sync(b"echo0:p", OpenFileMode::empty()).unwrap();
        assert_eq!(
            get_parameter_sync(handle, FileParam::Size),
            Some(0x1_0000_0004)
        );
        // unknown key refuses in-band
        assert!(get_parameter_sync(handle, FileParam::SourcePort).is_none());
        assert_eq!(
            get_file_parameter(handle, 0xDEAD),
            IO_REQUEST_FAILURE
        );
        assert!(close_sync(handle));
    }

    #[test]
    fn wildcards_match_ascii_runs() {
        assert!(match_wildcard(b"*", b"anything"));
        assert!(match_wildcard(b"disk*", b"disk0"));
        assert!(match_wildcard(b"*.txt", b"readme.txt"));
        assert!(!match_wildcard(b"*.txt", b"readme.md"));
        assert!(match_wildcard(b"a*b*c", b"a-very-big-c"));
        assert!(!match_wildcard(b"abc", b"abcd"));
    }
}
