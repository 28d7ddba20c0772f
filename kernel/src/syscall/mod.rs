//! System-call table: fixed numeric slots for the core services, dynamic
//! slots above them for named services registered at runtime.
//!
//! The dispatch vector is a ring-3 callable software interrupt; its handler
//! copies the caller's argument registers into a [`SyscallContext`], runs
//! the table entry, and writes up to six return registers back. Kernel
//! tasks reach the same table through [`kernel_call`] without taking the
//! interrupt gate.

use conquer_once::spin::OnceCell;

use crate::spinlock::SpinLock;

/// Software interrupt number of the system-call gate.
pub const SYSCALL_VECTOR: u8 = 127;

pub const MAX_ARGUMENTS: usize = 5;
pub const MAX_RETURNS: usize = 6;

/// Numeric slots below this bound are reserved for the core services.
pub const RESERVED_CALL_COUNT: usize = 32;
/// Total table size; slots above the reserved bound are assigned to named
/// services in registration order.
pub const CALL_COUNT: usize = 64;

pub const MAX_SERVICE_NAME: usize = 16;

/// Reserved call numbers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ReservedCall {
    /// Dispatched through the calling task's own hook.
    TaskDefined = 1,
    QueryService = 5,
    WaitIo = 6,
    CancelIo = 7,
    AllocateHeap = 8,
    ReleaseHeap = 9,
    TranslatePage = 10,
    DiscoverResource = 12,
    CreateThread = 14,
    Terminate = 15,
    SetAlarm = 16,
    GetTime = 17,
    OpenFile = 20,
    CloseFile = 24,
    ReadFile = 25,
    WriteFile = 26,
    SeekReadFile = 28,
    SeekWriteFile = 29,
    GetFileParameter = 30,
    SetFileParameter = 31,
}

/// Negative in-band errors of the service name space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum ServiceError {
    InvalidName = -1024,
    ServiceExisting = -1023,
    ServiceNotExisting = -1022,
    TooManyServices = -1021,
}

/// Register file of one call, in dispatch form: eax is the number going in
/// and `returns[0]` coming out; edx, ecx, ebx, esi, edi carry the arguments
/// and the remaining return values.
pub struct SyscallContext {
    pub number: u32,
    pub arguments: [usize; MAX_ARGUMENTS],
    pub returns: [usize; MAX_RETURNS],
    /// The registered argument of the entry being dispatched.
    pub argument: usize,
}

impl SyscallContext {
    pub fn new(number: u32, arguments: [usize; MAX_ARGUMENTS]) -> Self {
        Self {
            number,
            arguments,
            returns: [0; MAX_RETURNS],
            argument: 0,
        }
    }
}

pub type SyscallFn = fn(&mut SyscallContext);

#[derive(Clone, Copy)]
struct Entry {
    /// Empty for reserved slots; dynamic slots carry their service name.
    name: [u8; MAX_SERVICE_NAME],
    name_len: usize,
    function: Option<SyscallFn>,
    argument: usize,
}

impl Entry {
    const EMPTY: Entry = Entry {
        name: [0; MAX_SERVICE_NAME],
        name_len: 0,
        function: None,
        argument: 0,
    };
}

struct TableInner {
    entries: [Entry; CALL_COUNT],
    /// Next dynamic slot; starts at the reserved bound.
    used: usize,
}

pub struct SyscallTable {
    inner: SpinLock<TableInner>,
}

fn valid_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME
        && name
            .iter()
            .all(|&byte| byte.is_ascii_lowercase() || byte.is_ascii_digit())
}

impl SyscallTable {
    fn new() -> Self {
        Self {
            inner: SpinLock::new(TableInner {
                entries: [Entry::EMPTY; CALL_COUNT],
                used: RESERVED_CALL_COUNT,
            }),
        }
    }

    /// Install a core service on its reserved number. Double registration
    /// is a kernel bug.
    pub fn register_reserved(&self, call: ReservedCall, function: SyscallFn, argument: usize) {
        let number = call as usize;
        assert!(number < RESERVED_CALL_COUNT);
        let mut inner = self.inner.lock();
        assert!(
            inner.entries[number].function.is_none(),
            "reserved call {:?} registered twice",
            call
        );
        inner.entries[number] = Entry {
            name: [0; MAX_SERVICE_NAME],
            name_len: 0,
            function: Some(function),
            argument,
        };
    }

    fn find_by_name(inner: &TableInner, name: &[u8]) -> Option<usize> {
        (RESERVED_CALL_COUNT..inner.used)
            .find(|&number| &inner.entries[number].name[..inner.entries[number].name_len] == name)
    }

    /// Assign the next dynamic slot to `name`. Returns the call number.
    pub fn register_service(
        &self,
        name: &[u8],
        function: SyscallFn,
        argument: usize,
    ) -> Result<u32, ServiceError> {
        if !valid_name(name) {
            return Err(ServiceError::InvalidName);
        }
        let mut inner = self.inner.lock();
        if Self::find_by_name(&inner, name).is_some() {
            return Err(ServiceError::ServiceExisting);
        }
        if inner.used == CALL_COUNT {
            return Err(ServiceError::TooManyServices);
        }
        let number = inner.used;
        inner.used += 1;
        let entry = &mut inner.entries[number];
        entry.name[..name.len()].copy_from_slice(name);
        entry.name_len = name.len();
        entry.function = Some(function);
        entry.argument = argument;
        log::info!(
            "service {:?} registered as call {}",
            core::str::from_utf8(name).unwrap_or("?"),
            number
        );
        Ok(number as u32)
    }

    /// Look a named service up; its number is stable for the kernel's
    /// lifetime.
    pub fn query_service(&self, name: &[u8]) -> Result<u32, ServiceError> {
        if !valid_name(name) {
            return Err(ServiceError::InvalidName);
        }
        let inner = self.inner.lock();
        Self::find_by_name(&inner, name)
            .map(|number| number as u32)
            .ok_or(ServiceError::ServiceNotExisting)
    }

    /// Run the entry for `ctx.number`. Unknown numbers report
    /// `IO_REQUEST_FAILURE` in the first return register.
    pub fn dispatch(&self, ctx: &mut SyscallContext) {
        let entry = {
            let inner = self.inner.lock();
            match inner.entries.get(ctx.number as usize) {
                Some(entry) if entry.function.is_some() => *entry,
                _ => {
                    log::warn!("unregistered system call {}", ctx.number);
                    ctx.returns[0] = crate::io::IO_REQUEST_FAILURE;
                    return;
                }
            }
        };
        let saved = ctx.argument;
        ctx.argument = entry.argument;
        (entry.function.unwrap())(ctx);
        ctx.argument = saved;
    }
}

static TABLE: OnceCell<SyscallTable> = OnceCell::uninit();

/// Build the global table and install the query-service entry. The other
/// core services register themselves from their subsystems' init.
pub fn init() -> &'static SyscallTable {
    let table = TABLE.get_or_init(SyscallTable::new);
    table.register_reserved(ReservedCall::QueryService, query_service_call, 0);
    table
}

pub fn table() -> &'static SyscallTable {
    TABLE.get().expect("system-call table not initialised")
}

/// Kernel-side entry into the table, bypassing the interrupt gate.
pub fn kernel_call(number: u32, arguments: [usize; MAX_ARGUMENTS]) -> [usize; MAX_RETURNS] {
    let mut ctx = SyscallContext::new(number, arguments);
    table().dispatch(&mut ctx);
    ctx.returns
}

/// `query_service`: the name arrives packed into the four argument
/// registers, NUL-padded.
fn query_service_call(ctx: &mut SyscallContext) {
    let mut packed = [0u8; MAX_SERVICE_NAME];
    for (index, word) in ctx.arguments[..4].iter().enumerate() {
        packed[index * 4..index * 4 + 4].copy_from_slice(&(*word as u32).to_le_bytes());
    }
    let len = packed.iter().position(|&byte| byte == 0).unwrap_or(MAX_SERVICE_NAME);
    let result = match table().query_service(&packed[..len]) {
        Ok(number) => number as i32,
        Err(error) => error as i32,
    };
    ctx.returns[0] = result as usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_call(ctx: &mut SyscallContext) {
        ctx.returns[0] = ctx.arguments[0] + ctx.argument;
    }

    #[test]
    fn dynamic_registration_and_dispatch() {
        let table = SyscallTable::new();
        let number = table.register_service(b"blockcache", probe_call, 100).unwrap();
        assert!(number as usize >= RESERVED_CALL_COUNT);
        assert_eq!(table.query_service(b"blockcache"), Ok(number));

        let mut ctx = SyscallContext::new(number, [7, 0, 0, 0, 0]);
        table.dispatch(&mut ctx);
        assert_eq!(ctx.returns[0], 107);
        // the table argument does not leak out of the dispatch
        assert_eq!(ctx.argument, 0);
    }

    #[test]
    fn name_space_errors_are_in_band() {
        let table = SyscallTable::new();
        assert_eq!(
            table.register_service(b"", probe_call, 0),
            Err(ServiceError::InvalidName)
        );
        assert_eq!(
            table.register_service(b"Not-Valid!", probe_call, 0),
            Err(ServiceError::InvalidName)
        );
        assert_eq!(
            table.query_service(b"nosuchsvc"),
            Err(ServiceError::ServiceNotExisting)
        );
        table.register_service(b"ethframe", probe_call, 0).unwrap();
        assert_eq!(
            table.register_service(b"ethframe", probe_call, 0),
            Err(ServiceError::ServiceExisting)
        );
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let table = SyscallTable::new();
        let mut name = *b"svc\0\0\0\0\0";
        for index in 0..(CALL_COUNT - RESERVED_CALL_COUNT) {
            name[3] = b'a' + (index / 26) as u8;
            name[4] = b'a' + (index % 26) as u8;
            table.register_service(&name[..5], probe_call, 0).unwrap();
        }
        assert_eq!(
            table.register_service(b"onemore", probe_call, 0),
            Err(ServiceError::TooManyServices)
        );
    }

    #[test]
    fn unknown_numbers_fail_in_band() {
        let table = SyscallTable::new();
        let mut ctx = SyscallContext::new(2, [0; MAX_ARGUMENTS]);
        table.dispatch(&mut ctx);
        assert_eq!(ctx.returns[0], crate::io::IO_REQUEST_FAILURE);
        let mut ctx = SyscallContext::new(9999, [0; MAX_ARGUMENTS]);
        table.dispatch(&mut ctx);
        assert_eq!(ctx.returns[0], crate::io::IO_REQUEST_FAILURE);
    }
}
