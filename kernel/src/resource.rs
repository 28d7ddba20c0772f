//! Resource registry: enumerate-with-wait over published descriptors.
//!
//! Each resource type keeps a list of descriptors closed by a sentinel
//! tail. An enumerator is an open file at the synthetic `resource:<type>`
//! prefix; its cursor walks the list one descriptor per read and parks on
//! whichever node it has reached. Reads at the sentinel block until a
//! matching publication arrives or the handle closes, so discovery and
//! hotplug share one mechanism.

use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;

use crate::fs::{
    self, CloseRequest, EnumPayload, FileEnumeration, FileNameOps, FileOps, IoBuffer,
    OpenFileMode, OpenRequest, OpenedFile, RwRequest,
};
use crate::io::IoHandle;
use crate::spinlock::SpinLock;
use crate::syscall::{ReservedCall, SyscallContext, SyscallTable};

pub const RESOURCE_TYPE_COUNT: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum ResourceType {
    Unknown = 0,
    DiskPartition = 1,
    FileSystem = 2,
    DataLink = 3,
}

impl ResourceType {
    fn subpath(self) -> &'static [u8] {
        match self {
            ResourceType::Unknown => b"?",
            ResourceType::DiskPartition => b"diskpartition",
            ResourceType::FileSystem => b"filesystem",
            ResourceType::DataLink => b"datalink",
        }
    }

    fn from_subpath(path: &[u8]) -> Option<ResourceType> {
        [
            ResourceType::Unknown,
            ResourceType::DiskPartition,
            ResourceType::FileSystem,
            ResourceType::DataLink,
        ]
        .into_iter()
        .find(|kind| kind.subpath() == path)
    }

    /// Type-specific identity of a descriptor: plain name for most kinds,
    /// name plus start LBA for disk partitions (two partitions of the same
    /// name can coexist on different disks).
    fn describes_same(self, a: &FileEnumeration, b: &FileEnumeration) -> bool {
        if a.name() != b.name() {
            return false;
        }
        match self {
            ResourceType::DiskPartition => match (a.payload, b.payload) {
                (
                    EnumPayload::DiskPartition { start_lba: lba_a, .. },
                    EnumPayload::DiskPartition { start_lba: lba_b, .. },
                ) => lba_a == lba_b,
                _ => false,
            },
            _ => true,
        }
    }
}

type NodeId = usize;
type EnumId = usize;

struct ResourceNode {
    descriptor: FileEnumeration,
    next: NodeId,
    prev: NodeId,
    /// Enumerators whose cursor currently rests on this node.
    parked: Vec<EnumId>,
}

struct PendingRead {
    request: RwRequest,
    buffer: IoBuffer,
}

struct EnumeratorState {
    at: NodeId,
    pending: Vec<PendingRead>,
}

const NO_NODE: NodeId = usize::MAX;

struct ListInner {
    nodes: Vec<Option<ResourceNode>>,
    enumerators: Vec<Option<EnumeratorState>>,
    head: NodeId,
    sentinel: NodeId,
}

struct ResourceList {
    kind: ResourceType,
    inner: SpinLock<ListInner>,
}

impl ResourceList {
    fn new(kind: ResourceType) -> Self {
        let sentinel = ResourceNode {
            descriptor: FileEnumeration::named(b""),
            next: NO_NODE,
            prev: NO_NODE,
            parked: Vec::new(),
        };
        Self {
            kind,
            inner: SpinLock::new(ListInner {
                nodes: alloc::vec![Some(sentinel)],
                enumerators: Vec::new(),
                head: 0,
                sentinel: 0,
            }),
        }
    }
}

impl ListInner {
    fn node(&self, id: NodeId) -> &ResourceNode {
        self.nodes[id].as_ref().expect("resource node vanished")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut ResourceNode {
        self.nodes[id].as_mut().expect("resource node vanished")
    }

    fn insert_slot(&mut self, node: ResourceNode) -> NodeId {
        match self.nodes.iter().position(Option::is_none) {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Move an enumerator's cursor from its current node to `to`.
    fn repark(&mut self, enumerator: EnumId, to: NodeId) {
        let from = self.enumerators[enumerator]
            .as_ref()
            .expect("enumerator vanished")
            .at;
        self.node_mut(from).parked.retain(|&id| id != enumerator);
        self.node_mut(to).parked.push(enumerator);
        self.enumerators[enumerator].as_mut().unwrap().at = to;
    }

    fn find(&self, kind: ResourceType, descriptor: &FileEnumeration) -> Option<NodeId> {
        let mut id = self.head;
        while id != self.sentinel {
            let node = self.node(id);
            if kind.describes_same(&node.descriptor, descriptor) {
                return Some(id);
            }
            id = node.next;
        }
        None
    }
}

/// One deliverable (request, descriptor) pair collected under the lock and
/// completed outside it.
struct Delivery {
    request: RwRequest,
    buffer: IoBuffer,
    descriptor: FileEnumeration,
}

fn deliver(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        // SAFETY: an enumeration read's buffer stays valid until its
        // request completes
        let copied = unsafe {
            let descriptor_bytes = core::slice::from_raw_parts(
                &delivery.descriptor as *const FileEnumeration as *const u8,
                core::mem::size_of::<FileEnumeration>(),
            );
            delivery.buffer.fill_from(descriptor_bytes)
        };
        delivery.request.complete(copied, 0);
    }
}

impl ResourceList {
    /// Publish a descriptor: insert before the sentinel, walk every
    /// enumerator parked on the sentinel back onto the new node, then
    /// complete those of their reads that are still claimable.
    fn add(&self, descriptor: FileEnumeration) -> bool {
        let mut deliveries = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.find(self.kind, &descriptor).is_some() {
                return false;
            }
            let sentinel = inner.sentinel;
            let prev = inner.node(sentinel).prev;
            let id = inner.insert_slot(ResourceNode {
                descriptor,
                next: sentinel,
                prev,
                parked: Vec::new(),
            });
            if prev == NO_NODE {
                inner.head = id;
            } else {
                inner.node_mut(prev).next = id;
            }
            inner.node_mut(sentinel).prev = id;

            let waiting: Vec<EnumId> = core::mem::take(&mut inner.node_mut(sentinel).parked);
            for enumerator in waiting {
                inner.node_mut(id).parked.push(enumerator);
                inner.enumerators[enumerator].as_mut().unwrap().at = id;
                // hand the new descriptor to one still-live read, advancing
                // the cursor back to the sentinel
                loop {
                    let pending = {
                        let state = inner.enumerators[enumerator].as_mut().unwrap();
                        if state.pending.is_empty() {
                            break;
                        }
                        state.pending.remove(0)
                    };
                    if pending.request.claim() {
                        deliveries.push(Delivery {
                            request: pending.request,
                            buffer: pending.buffer,
                            descriptor,
                        });
                        inner.repark(enumerator, sentinel);
                        break;
                    }
                    // that read was cancelled under us; try the next one
                }
            }
        }
        deliver(deliveries);
        true
    }

    /// Withdraw a descriptor; enumerators parked on it move to its
    /// successor and stay consistent.
    fn remove(&self, descriptor: &FileEnumeration) {
        let mut inner = self.inner.lock();
        let id = match inner.find(self.kind, descriptor) {
            Some(id) => id,
            None => return,
        };
        let (next, prev) = {
            let node = inner.node(id);
            (node.next, node.prev)
        };
        let parked: Vec<EnumId> = core::mem::take(&mut inner.node_mut(id).parked);
        for enumerator in parked {
            inner.node_mut(next).parked.push(enumerator);
            inner.enumerators[enumerator].as_mut().unwrap().at = next;
        }
        if prev == NO_NODE {
            inner.head = next;
        } else {
            inner.node_mut(prev).next = next;
        }
        inner.node_mut(next).prev = prev;
        inner.nodes[id] = None;
    }
}

static LISTS: OnceCell<[ResourceList; RESOURCE_TYPE_COUNT]> = OnceCell::uninit();

fn list_of(kind: ResourceType) -> &'static ResourceList {
    let lists = LISTS.get_or_init(|| {
        [
            ResourceList::new(ResourceType::Unknown),
            ResourceList::new(ResourceType::DiskPartition),
            ResourceList::new(ResourceType::FileSystem),
            ResourceList::new(ResourceType::DataLink),
        ]
    });
    &lists[kind as usize]
}

// ---------------------------------------------------------------------------
// The enumerator as an open file
// ---------------------------------------------------------------------------

struct Enumerator {
    list: &'static ResourceList,
    id: EnumId,
}

impl Enumerator {
    fn attach(list: &'static ResourceList) -> Arc<Enumerator> {
        let mut inner = list.inner.lock();
        let head = inner.head;
        let id = match inner.enumerators.iter().position(Option::is_none) {
            Some(id) => id,
            None => {
                inner.enumerators.push(None);
                inner.enumerators.len() - 1
            }
        };
        inner.enumerators[id] = Some(EnumeratorState {
            at: head,
            pending: Vec::new(),
        });
        inner.node_mut(head).parked.push(id);
        drop(inner);
        Arc::new(Enumerator { list, id })
    }

    fn unpark(argument: usize, handle: IoHandle) {
        let enumerator = unsafe { &*(argument as *const Enumerator) };
        let mut inner = enumerator.list.inner.lock();
        if let Some(state) = inner.enumerators[enumerator.id].as_mut() {
            state.pending.retain(|pending| pending.request.handle() != handle);
        }
    }
}

impl FileOps for Enumerator {
    /// Yield the descriptor under the cursor and advance, or park the read
    /// at the sentinel until a publication satisfies it.
    fn read(&self, req: RwRequest, _file: &OpenedFile, buffer: IoBuffer) -> bool {
        if buffer.len() < core::mem::size_of::<FileEnumeration>() {
            return false;
        }
        let delivery = {
            let mut inner = self.list.inner.lock();
            let at = inner.enumerators[self.id].as_ref().unwrap().at;
            if at == inner.sentinel {
                req.park_cancellable(Enumerator::unpark, self as *const Enumerator as usize);
                inner.enumerators[self.id]
                    .as_mut()
                    .unwrap()
                    .pending
                    .push(PendingRead {
                        request: req,
                        buffer,
                    });
                None
            } else if req.claim() {
                let descriptor = inner.node(at).descriptor;
                let next = inner.node(at).next;
                inner.repark(self.id, next);
                Some(Delivery {
                    request: req,
                    buffer,
                    descriptor,
                })
            } else {
                // a concurrent cancel took the request before the cursor
                // moved; the enumerator stays where it is
                None
            }
        };
        if let Some(delivery) = delivery {
            deliver(alloc::vec![delivery]);
        }
        true
    }

    fn close(&self, req: CloseRequest, _file: &OpenedFile) {
        let mut inner = self.list.inner.lock();
        let state = inner.enumerators[self.id]
            .take()
            .expect("enumerator closed twice");
        assert!(state.pending.is_empty(), "closing an enumerator with reads in flight");
        inner.node_mut(state.at).parked.retain(|&id| id != self.id);
        drop(inner);
        req.complete();
    }
}

struct ResourceProvider;

impl FileNameOps for ResourceProvider {
    fn open(&self, req: OpenRequest, path: &[u8], mode: OpenFileMode) -> bool {
        if !mode.contains(OpenFileMode::ENUMERATE) {
            return false;
        }
        let kind = match ResourceType::from_subpath(path) {
            Some(kind) => kind,
            None => return false,
        };
        req.complete(Enumerator::attach(list_of(kind)));
        true
    }
}

// ---------------------------------------------------------------------------
// Publication API
// ---------------------------------------------------------------------------

/// Publish a descriptor; false when an equal one already exists.
pub fn create_add_resource(kind: ResourceType, descriptor: FileEnumeration) -> bool {
    list_of(kind).add(descriptor)
}

pub fn delete_resource(kind: ResourceType, descriptor: &FileEnumeration) {
    list_of(kind).remove(descriptor);
}

/// Announce one partition found by a disk driver.
#[allow(clippy::too_many_arguments)]
pub fn add_disk_partition(
    name: &[u8],
    partition_type: u8,
    start_lba: u64,
    sector_count: u64,
    sector_size: u32,
    disk_code: usize,
) -> bool {
    let mut descriptor = FileEnumeration::named(name);
    descriptor.payload = EnumPayload::DiskPartition {
        partition_type,
        start_lba,
        sector_count,
        sector_size,
        disk_code,
    };
    create_add_resource(ResourceType::DiskPartition, descriptor)
}

/// Announce a mounted file-system service.
pub fn add_file_system(name: &[u8], service: u32) -> bool {
    let mut descriptor = FileEnumeration::named(name);
    descriptor.payload = EnumPayload::FileSystem { service };
    create_add_resource(ResourceType::FileSystem, descriptor)
}

/// Announce a data-link (NIC) device.
pub fn add_data_link(name: &[u8], address: u64) -> bool {
    let mut descriptor = FileEnumeration::named(name);
    descriptor.payload = EnumPayload::DataLink { address };
    create_add_resource(ResourceType::DataLink, descriptor)
}

/// Block until a resource whose name matches `pattern` (ASCII wildcards)
/// exists, and return its descriptor.
pub fn wait_for_first_resource(kind: ResourceType, pattern: &[u8]) -> Option<FileEnumeration> {
    let mut path = alloc::vec::Vec::from(&b"resource:"[..]);
    path.extend_from_slice(kind.subpath());
    let handle = fs::enumerate_sync(&path)?;
    let mut result = None;
    loop {
        let mut descriptor = FileEnumeration::named(b"");
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(
                &mut descriptor as *mut FileEnumeration as *mut u8,
                core::mem::size_of::<FileEnumeration>(),
            )
        };
        match fs::read_sync(handle, bytes) {
            Some(size) if size == core::mem::size_of::<FileEnumeration>() => {
                if fs::match_wildcard(pattern, descriptor.name()) {
                    result = Some(descriptor);
                    break;
                }
            }
            _ => break,
        }
    }
    fs::close_sync(handle);
    result
}

// ---------------------------------------------------------------------------
// Initialisation and system-call surface
// ---------------------------------------------------------------------------

pub fn init() {
    fs::register_file_system(b"resource", Arc::new(ResourceProvider))
        .expect("cannot register the resource registry");
}

/// `discover_resource(type)`: open an enumerator over the given type.
pub fn register_syscalls(table: &SyscallTable) {
    table.register_reserved(ReservedCall::DiscoverResource, discover_resource_call, 0);
}

fn discover_resource_call(ctx: &mut SyscallContext) {
    let kind = match ctx.arguments[0] {
        0 => ResourceType::Unknown,
        1 => ResourceType::DiskPartition,
        2 => ResourceType::FileSystem,
        3 => ResourceType::DataLink,
        _ => {
            ctx.returns[0] = crate::io::IO_REQUEST_FAILURE;
            return;
        }
    };
    let mut path = alloc::vec::Vec::from(&b"resource:"[..]);
    path.extend_from_slice(kind.subpath());
    ctx.returns[0] = fs::open_file(&path, OpenFileMode::ENUMERATE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{self, IO_REQUEST_FAILURE};
    use crate::task::scheduler;

    /// The registry lists are process-global; serialise the tests that
    /// publish into them.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn setup() -> std::sync::MutexGuard<'static, ()> {
        scheduler::ensure_bootstrap_task();
        let _ = fs::register_file_system(b"resource", Arc::new(ResourceProvider));
        TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_descriptor(handle: IoHandle) -> Option<FileEnumeration> {
        let mut descriptor = FileEnumeration::named(b"");
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(
                &mut descriptor as *mut FileEnumeration as *mut u8,
                core::mem::size_of::<FileEnumeration>(),
            )
        };
        let size = fs::read_sync(handle, bytes)?;
        (size == core::mem::size_of::<FileEnumeration>()).then_some(descriptor)
    }

    #[test]
    fn enumeration_sees_each_descriptor_once() {
        let _guard = setup();
        assert!(add_file_system(b"fsenum0", 40));
        assert!(add_file_system(b"fsenum1", 41));
        let handle = fs::enumerate_sync(b"resource:filesystem").unwrap();
        let mut seen = alloc::vec::Vec::new();
        // drain what is already published without blocking
        for _ in 0..2 {
            let descriptor = read_descriptor(handle).unwrap();
            seen.push(alloc::vec::Vec::from(descriptor.name()));
        }
        assert!(seen.iter().any(|name| name == b"fsenum0"));
        assert!(seen.iter().any(|name| name == b"fsenum1"));
        assert!(fs::close_sync(handle));
        delete_resource(ResourceType::FileSystem, &FileEnumeration::named(b"fsenum0"));
        delete_resource(ResourceType::FileSystem, &FileEnumeration::named(b"fsenum1"));
    }

    #[test]
    fn waiting_read_completes_on_publication() {
        let _guard = setup();
        let handle = fs::enumerate_sync(b"resource:diskpartition").unwrap();
        let mut descriptor = FileEnumeration::named(b"");
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(
                &mut descriptor as *mut FileEnumeration as *mut u8,
                core::mem::size_of::<FileEnumeration>(),
            )
        };
        let request = fs::read_file(handle, fs::IoBuffer::from_slice(bytes));
        assert_ne!(request, IO_REQUEST_FAILURE);
        // the list is empty: the read parks at the sentinel
        let task = scheduler::current_task();
        assert_eq!(task.io.lock().completed_count(), 0);

        assert!(add_disk_partition(b"part2048", 0x0B, 2048, 65536, 512, 7));
        let (values, count) = io::wait_io(request).unwrap();
        assert_eq!(count, 1);
        assert_eq!(values[0], core::mem::size_of::<FileEnumeration>());
        assert_eq!(descriptor.name(), b"part2048");
        match descriptor.payload {
            EnumPayload::DiskPartition { start_lba, .. } => assert_eq!(start_lba, 2048),
            other => panic!("wrong payload {:?}", other),
        }

        // published exactly once: the next read parks again
        let request = fs::read_file(handle, fs::IoBuffer::from_slice(bytes));
        assert_ne!(request, IO_REQUEST_FAILURE);
        assert_eq!(task.io.lock().completed_count(), 0);
        assert!(io::cancel_io(request));
        assert!(fs::close_sync(handle));
        delete_resource(
            ResourceType::DiskPartition,
            &{
                let mut d = FileEnumeration::named(b"part2048");
                d.payload = EnumPayload::DiskPartition {
                    partition_type: 0x0B,
                    start_lba: 2048,
                    sector_count: 65536,
                    sector_size: 512,
                    disk_code: 7,
                };
                d
            },
        );
    }

    #[test]
    fn duplicate_publications_are_refused() {
        let _guard = setup();
        assert!(add_file_system(b"fsdup", 9));
        assert!(!add_file_system(b"fsdup", 9));
        // partitions use name + start LBA as identity
        assert!(add_disk_partition(b"pdup", 0x0C, 100, 10, 512, 1));
        assert!(add_disk_partition(b"pdup", 0x0C, 200, 10, 512, 1));
        assert!(!add_disk_partition(b"pdup", 0x0C, 100, 99, 512, 9));
        delete_resource(ResourceType::FileSystem, &FileEnumeration::named(b"fsdup"));
        for lba in [100u64, 200] {
            let mut descriptor = FileEnumeration::named(b"pdup");
            descriptor.payload = EnumPayload::DiskPartition {
                partition_type: 0x0C,
                start_lba: lba,
                sector_count: 10,
                sector_size: 512,
                disk_code: 1,
            };
            delete_resource(ResourceType::DiskPartition, &descriptor);
        }
    }

    #[test]
    fn deletion_moves_parked_enumerators_forward() {
        let _guard = setup();
        assert!(add_data_link(b"nic0", 0x5254_0012_3456));
        let handle = fs::enumerate_sync(b"resource:datalink").unwrap();
        // the cursor parks on nic0 (the head); deleting it must advance the
        // cursor to the sentinel, not strand it
        let mut link0 = FileEnumeration::named(b"nic0");
        link0.payload = EnumPayload::DataLink {
            address: 0x5254_0012_3456,
        };
        delete_resource(ResourceType::DataLink, &link0);

        assert!(add_data_link(b"nic1", 0x5254_0098_7654));
        let descriptor = read_descriptor(handle).unwrap();
        assert_eq!(descriptor.name(), b"nic1");
        assert!(fs::close_sync(handle));
        let mut link1 = FileEnumeration::named(b"nic1");
        link1.payload = EnumPayload::DataLink {
            address: 0x5254_0098_7654,
        };
        delete_resource(ResourceType::DataLink, &link1);
    }

    #[test]
    fn wait_for_first_resource_matches_wildcards() {
        let _guard = setup();
        assert!(add_file_system(b"fatvolume3", 17));
        let found = wait_for_first_resource(ResourceType::FileSystem, b"fatvol*").unwrap();
        assert_eq!(found.name(), b"fatvolume3");
        match found.payload {
            EnumPayload::FileSystem { service } => assert_eq!(service, 17),
            other => panic!("wrong payload {:?}", other),
        }
        delete_resource(
            ResourceType::FileSystem,
            &FileEnumeration::named(b"fatvolume3"),
        );
    }
}
