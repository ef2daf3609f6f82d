// Opaque stand-ins for the file-descriptor table and the inode the
// process's current directory points at. spec.md §3 calls both fields
// out as "opaque to this spec, managed by external collaborators" —
// the scheduler core only ever clones or drops them on fork/exit, it
// never looks inside. A real file-system subsystem is out of scope.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FileHandle(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Inode(pub u32);

/// Increment the file's reference count. Real ref-counting lives in the
/// (out-of-scope) file table; here it is a pass-through so fork()'s
/// "duplicate the parent's open files" step has something to call.
pub fn file_dup(f: FileHandle) -> FileHandle {
    f
}

/// Decrement the file's reference count, closing it at zero. No-op
/// placeholder for the same reason as `file_dup`.
pub fn file_close(_f: FileHandle) {}

pub fn inode_dup(i: Inode) -> Inode {
    i
}

pub fn inode_put(_i: Inode) {}
