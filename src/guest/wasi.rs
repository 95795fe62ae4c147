//! WASI preview 1 over the staging filesystem.
//!
//! Enough of `wasi_snapshot_preview1` for the engine to start, read its
//! arguments and environment, write to the console and load program text
//! from a [`MemoryFs`] preopened at `/`. Imports outside this subset are
//! defined as traps when the module is instantiated, so a guest that never
//! calls them still links.
//!
//! Every operation is a method on [`WasiCtx`] taking the guest memory
//! explicitly; the import wrappers split the store into linear memory and
//! context for the duration of the call.

use super::linker::{GuestState, HostFunctionProvider, HostLinkerBuilder, LinkerError};
use super::{indirect, read_string, write_u32, Console, GuestMemory, Ptr};
use crate::error::{FsError, GuestError};
use crate::vfs::{self, File, MemoryFs, Metadata, OpenOptions};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use wasmtime::{Caller, Extern};

/// Module name of the WASI preview 1 imports.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Descriptor of the preopened root directory.
pub const ROOT_FD: u32 = 3;

pub mod errno {
    pub const SUCCESS: i32 = 0;
    pub const ACCES: i32 = 2;
    pub const BADF: i32 = 8;
    pub const EXIST: i32 = 20;
    pub const FAULT: i32 = 21;
    pub const INVAL: i32 = 28;
    pub const ISDIR: i32 = 31;
    pub const NOENT: i32 = 44;
    pub const NOTDIR: i32 = 54;
    pub const NOTEMPTY: i32 = 55;
    pub const SPIPE: i32 = 70;
}

const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const FILETYPE_DIRECTORY: u8 = 3;
const FILETYPE_REGULAR_FILE: u8 = 4;

const OFLAGS_CREAT: i32 = 1;
const OFLAGS_DIRECTORY: i32 = 2;
const OFLAGS_EXCL: i32 = 4;
const OFLAGS_TRUNC: i32 = 8;
const FDFLAGS_APPEND: i32 = 1;
const RIGHTS_FD_READ: i64 = 1 << 1;
const RIGHTS_FD_WRITE: i64 = 1 << 6;
const RIGHTS_ALL: u64 = (1 << 30) - 1;

/// `proc_exit` was called; carried as the trap payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("guest exited with code {0}")]
pub struct ProcExit(pub i32);

type Errno = i32;

fn fs_errno(e: &FsError) -> Errno {
    match e {
        FsError::NotFound(_) => errno::NOENT,
        FsError::Exists(_) => errno::EXIST,
        FsError::NotADirectory(_) => errno::NOTDIR,
        FsError::IsADirectory(_) => errno::ISDIR,
        FsError::NotEmpty(_) => errno::NOTEMPTY,
        FsError::Access(_) => errno::BADF,
        FsError::InvalidSeek(_) => errno::INVAL,
    }
}

fn code(result: Result<(), Errno>) -> i32 {
    match result {
        Ok(()) => errno::SUCCESS,
        Err(e) => e,
    }
}

/// Process arguments, environment and filesystem the guest sees.
#[derive(Debug, Clone, Default)]
pub struct WasiConfig {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub fs: MemoryFs,
}

impl WasiConfig {
    pub fn new(fs: MemoryFs) -> Self {
        Self {
            fs,
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

enum Descriptor {
    Stdin,
    Stdout,
    Stderr,
    Dir(String),
    File(File),
}

/// Per-instance WASI state: configuration, console and descriptor table.
pub struct WasiCtx {
    args: Vec<String>,
    env: Vec<String>,
    fs: MemoryFs,
    console: Console,
    fds: HashMap<u32, Descriptor>,
    next_fd: u32,
    started: Instant,
}

impl WasiCtx {
    pub fn new(config: WasiConfig, console: Console) -> Self {
        let mut fds = HashMap::new();
        fds.insert(0, Descriptor::Stdin);
        fds.insert(1, Descriptor::Stdout);
        fds.insert(2, Descriptor::Stderr);
        fds.insert(ROOT_FD, Descriptor::Dir("/".to_string()));
        Self {
            args: config.args,
            env: config.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            fs: config.fs,
            console,
            fds,
            next_fd: ROOT_FD + 1,
            started: Instant::now(),
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn fs(&self) -> &MemoryFs {
        &self.fs
    }

    /// Files the guest has open.
    pub fn open_files(&self) -> usize {
        self.fds.values().filter(|d| matches!(d, Descriptor::File(_))).count()
    }

    fn get(&mut self, fd: i32) -> Result<&mut Descriptor, Errno> {
        u32::try_from(fd)
            .ok()
            .and_then(|fd| self.fds.get_mut(&fd))
            .ok_or(errno::BADF)
    }

    fn resolve(&mut self, mem: &mut dyn GuestMemory, dirfd: i32, path: Ptr, len: u32) -> Result<String, Errno> {
        let base = match self.get(dirfd)? {
            Descriptor::Dir(base) => base.clone(),
            Descriptor::File(_) => return Err(errno::NOTDIR),
            _ => return Err(errno::BADF),
        };
        let path = read_string(mem, path, Some(len)).map_err(|_| errno::FAULT)?;
        Ok(vfs::normalize(&format!("{base}/{path}")))
    }

    fn insert(&mut self, desc: Descriptor) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, desc);
        fd
    }

    // ------------------------------------------------------------------------
    // Arguments and environment
    // ------------------------------------------------------------------------

    pub fn args_sizes_get(&mut self, mem: &mut dyn GuestMemory, count: Ptr, size: Ptr) -> i32 {
        code(list_sizes(mem, &self.args, count, size))
    }

    pub fn args_get(&mut self, mem: &mut dyn GuestMemory, ptrs: Ptr, buf: Ptr) -> i32 {
        code(write_list(mem, &self.args, ptrs, buf))
    }

    pub fn environ_sizes_get(&mut self, mem: &mut dyn GuestMemory, count: Ptr, size: Ptr) -> i32 {
        code(list_sizes(mem, &self.env, count, size))
    }

    pub fn environ_get(&mut self, mem: &mut dyn GuestMemory, ptrs: Ptr, buf: Ptr) -> i32 {
        code(write_list(mem, &self.env, ptrs, buf))
    }

    // ------------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------------

    pub fn fd_write(&mut self, mem: &mut dyn GuestMemory, fd: i32, iovs: Ptr, iovs_len: i32, nwritten: Ptr) -> i32 {
        code(self.write_iovs(mem, fd, iovs, iovs_len, nwritten))
    }

    fn write_iovs(&mut self, mem: &mut dyn GuestMemory, fd: i32, iovs: Ptr, iovs_len: i32, nwritten: Ptr) -> Result<(), Errno> {
        let mut data = Vec::new();
        for (ptr, len) in iovecs(mem, iovs, iovs_len)? {
            let mut buf = vec![0u8; len as usize];
            mem.read(ptr, &mut buf).map_err(|_| errno::FAULT)?;
            data.extend_from_slice(&buf);
        }
        let console = self.console.clone();
        match self.get(fd)? {
            Descriptor::Stdout => console.write_stdout(&data),
            Descriptor::Stderr => console.write_stderr(&data),
            Descriptor::File(file) => {
                file.write(&data).map_err(|e| fs_errno(&e))?;
            }
            Descriptor::Stdin => return Err(errno::BADF),
            Descriptor::Dir(_) => return Err(errno::ISDIR),
        }
        write_u32(mem, nwritten, data.len() as u32).map_err(|_| errno::FAULT)
    }

    pub fn fd_read(&mut self, mem: &mut dyn GuestMemory, fd: i32, iovs: Ptr, iovs_len: i32, nread: Ptr) -> i32 {
        code(self.read_iovs(mem, fd, iovs, iovs_len, nread))
    }

    fn read_iovs(&mut self, mem: &mut dyn GuestMemory, fd: i32, iovs: Ptr, iovs_len: i32, nread: Ptr) -> Result<(), Errno> {
        let vecs = iovecs(mem, iovs, iovs_len)?;
        let total: usize = vecs.iter().map(|(_, len)| *len as usize).sum();
        let mut data = vec![0u8; total];
        let n = match self.get(fd)? {
            Descriptor::Stdin => 0,
            Descriptor::File(file) => file.read(&mut data).map_err(|e| fs_errno(&e))?,
            Descriptor::Dir(_) => return Err(errno::ISDIR),
            Descriptor::Stdout | Descriptor::Stderr => return Err(errno::BADF),
        };
        let mut at = 0;
        for (ptr, len) in vecs {
            if at == n {
                break;
            }
            let take = (len as usize).min(n - at);
            mem.write(ptr, &data[at..at + take]).map_err(|_| errno::FAULT)?;
            at += take;
        }
        write_u32(mem, nread, n as u32).map_err(|_| errno::FAULT)
    }

    pub fn fd_close(&mut self, fd: i32) -> i32 {
        let removed = u32::try_from(fd).ok().and_then(|fd| self.fds.remove(&fd));
        match removed {
            Some(_) => errno::SUCCESS,
            None => errno::BADF,
        }
    }

    pub fn fd_seek(&mut self, mem: &mut dyn GuestMemory, fd: i32, offset: i64, whence: i32, out: Ptr) -> i32 {
        let result = (|| {
            let Descriptor::File(file) = self.get(fd)? else {
                return Err(errno::SPIPE);
            };
            let pos = match whence {
                0 => SeekFrom::Start(u64::try_from(offset).map_err(|_| errno::INVAL)?),
                1 => SeekFrom::Current(offset),
                2 => SeekFrom::End(offset),
                _ => return Err(errno::INVAL),
            };
            let at = file.seek(pos).map_err(|e| fs_errno(&e))?;
            mem.write(out, &at.to_le_bytes()).map_err(|_| errno::FAULT)
        })();
        code(result)
    }

    pub fn fd_tell(&mut self, mem: &mut dyn GuestMemory, fd: i32, out: Ptr) -> i32 {
        self.fd_seek(mem, fd, 0, 1, out)
    }

    pub fn fd_filestat_get(&mut self, mem: &mut dyn GuestMemory, fd: i32, buf: Ptr) -> i32 {
        let result = (|| {
            let stat = match self.get(fd)? {
                Descriptor::File(file) => {
                    let len = file.len().map_err(|e| fs_errno(&e))?;
                    filestat(FILETYPE_REGULAR_FILE, len)
                }
                Descriptor::Dir(_) => filestat(FILETYPE_DIRECTORY, 0),
                _ => filestat(FILETYPE_CHARACTER_DEVICE, 0),
            };
            mem.write(buf, &stat).map_err(|_| errno::FAULT)
        })();
        code(result)
    }

    pub fn fd_fdstat_get(&mut self, mem: &mut dyn GuestMemory, fd: i32, buf: Ptr) -> i32 {
        let result = (|| {
            let (filetype, flags) = match self.get(fd)? {
                Descriptor::File(file) => (FILETYPE_REGULAR_FILE, if file.options().append { FDFLAGS_APPEND } else { 0 }),
                Descriptor::Dir(_) => (FILETYPE_DIRECTORY, 0),
                _ => (FILETYPE_CHARACTER_DEVICE, 0),
            };
            let mut stat = [0u8; 24];
            stat[0] = filetype;
            stat[2..4].copy_from_slice(&(flags as u16).to_le_bytes());
            stat[8..16].copy_from_slice(&RIGHTS_ALL.to_le_bytes());
            stat[16..24].copy_from_slice(&RIGHTS_ALL.to_le_bytes());
            mem.write(buf, &stat).map_err(|_| errno::FAULT)
        })();
        code(result)
    }

    pub fn fd_prestat_get(&mut self, mem: &mut dyn GuestMemory, fd: i32, buf: Ptr) -> i32 {
        if fd as u32 != ROOT_FD || !self.fds.contains_key(&ROOT_FD) {
            return errno::BADF;
        }
        // tag 0 = directory, then the name length
        let result = write_u32(mem, buf, 0).and_then(|()| write_u32(mem, buf + 4, 1));
        code(result.map_err(|_| errno::FAULT))
    }

    pub fn fd_prestat_dir_name(&mut self, mem: &mut dyn GuestMemory, fd: i32, path: Ptr, len: u32) -> i32 {
        if fd as u32 != ROOT_FD || !self.fds.contains_key(&ROOT_FD) {
            return errno::BADF;
        }
        if len < 1 {
            return errno::INVAL;
        }
        code(mem.write(path, b"/").map_err(|_| errno::FAULT))
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn path_open(
        &mut self,
        mem: &mut dyn GuestMemory,
        dirfd: i32,
        path: Ptr,
        path_len: u32,
        oflags: i32,
        rights: i64,
        fdflags: i32,
        opened: Ptr,
    ) -> i32 {
        let result = (|| {
            let path = self.resolve(mem, dirfd, path, path_len)?;
            let create = oflags & OFLAGS_CREAT != 0;
            let exclusive = oflags & OFLAGS_EXCL != 0;
            let desc = match self.fs.stat(&path) {
                Ok(_) if create && exclusive => return Err(errno::EXIST),
                Ok(meta) if meta.is_dir() => Descriptor::Dir(path),
                Ok(_) if oflags & OFLAGS_DIRECTORY != 0 => return Err(errno::NOTDIR),
                Err(FsError::NotFound(_)) if !create => return Err(errno::NOENT),
                _ => {
                    let write = rights & RIGHTS_FD_WRITE != 0;
                    let truncate = oflags & OFLAGS_TRUNC != 0;
                    let opts = OpenOptions::new()
                        .read(rights & RIGHTS_FD_READ != 0 || !write)
                        .write(write || truncate)
                        .create(create)
                        .truncate(truncate)
                        .append(fdflags & FDFLAGS_APPEND != 0);
                    Descriptor::File(self.fs.open(&path, opts).map_err(|e| fs_errno(&e))?)
                }
            };
            let fd = self.insert(desc);
            write_u32(mem, opened, fd).map_err(|_| errno::FAULT)
        })();
        code(result)
    }

    pub fn path_filestat_get(&mut self, mem: &mut dyn GuestMemory, dirfd: i32, path: Ptr, len: u32, buf: Ptr) -> i32 {
        let result = (|| {
            let path = self.resolve(mem, dirfd, path, len)?;
            let meta: Metadata = self.fs.stat(&path).map_err(|e| fs_errno(&e))?;
            let kind = if meta.is_dir() { FILETYPE_DIRECTORY } else { FILETYPE_REGULAR_FILE };
            mem.write(buf, &filestat(kind, meta.len)).map_err(|_| errno::FAULT)
        })();
        code(result)
    }

    pub fn path_create_directory(&mut self, mem: &mut dyn GuestMemory, dirfd: i32, path: Ptr, len: u32) -> i32 {
        let result = self
            .resolve(mem, dirfd, path, len)
            .and_then(|path| self.fs.create_dir(&path).map_err(|e| fs_errno(&e)));
        code(result)
    }

    pub fn path_remove_directory(&mut self, mem: &mut dyn GuestMemory, dirfd: i32, path: Ptr, len: u32) -> i32 {
        let result = self
            .resolve(mem, dirfd, path, len)
            .and_then(|path| self.fs.remove_dir(&path).map_err(|e| fs_errno(&e)));
        code(result)
    }

    pub fn path_unlink_file(&mut self, mem: &mut dyn GuestMemory, dirfd: i32, path: Ptr, len: u32) -> i32 {
        let result = self
            .resolve(mem, dirfd, path, len)
            .and_then(|path| self.fs.remove_file(&path).map_err(|e| fs_errno(&e)));
        code(result)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn path_rename(
        &mut self,
        mem: &mut dyn GuestMemory,
        from_fd: i32,
        from: Ptr,
        from_len: u32,
        to_fd: i32,
        to: Ptr,
        to_len: u32,
    ) -> i32 {
        let result = (|| {
            let from = self.resolve(mem, from_fd, from, from_len)?;
            let to = self.resolve(mem, to_fd, to, to_len)?;
            self.fs.rename(&from, &to).map_err(|e| fs_errno(&e))
        })();
        code(result)
    }

    // ------------------------------------------------------------------------
    // Clocks and randomness
    // ------------------------------------------------------------------------

    pub fn clock_time_get(&mut self, mem: &mut dyn GuestMemory, id: i32, out: Ptr) -> i32 {
        let nanos = match id {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            1..=3 => self.started.elapsed().as_nanos() as u64,
            _ => return errno::INVAL,
        };
        code(mem.write(out, &nanos.to_le_bytes()).map_err(|_| errno::FAULT))
    }

    pub fn clock_res_get(&mut self, mem: &mut dyn GuestMemory, id: i32, out: Ptr) -> i32 {
        if !(0..=3).contains(&id) {
            return errno::INVAL;
        }
        code(mem.write(out, &1_000u64.to_le_bytes()).map_err(|_| errno::FAULT))
    }

    pub fn random_get(&mut self, mem: &mut dyn GuestMemory, buf: Ptr, len: u32) -> i32 {
        let mut bytes = vec![0u8; len as usize];
        rand::rng().fill_bytes(&mut bytes);
        code(mem.write(buf, &bytes).map_err(|_| errno::FAULT))
    }
}

/// `(ptr, len)` pairs of an iovec array.
fn iovecs(mem: &mut dyn GuestMemory, iovs: Ptr, count: i32) -> Result<Vec<(Ptr, u32)>, Errno> {
    (0..count.max(0) as u32)
        .map(|i| {
            let entry = iovs + i * 8;
            match (indirect(&mut *mem, entry), indirect(&mut *mem, entry + 4)) {
                (Ok(ptr), Ok(len)) => Ok((ptr, len)),
                _ => Err(errno::FAULT),
            }
        })
        .collect()
}

fn filestat(filetype: u8, size: u64) -> [u8; 64] {
    let mut stat = [0u8; 64];
    stat[16] = filetype;
    stat[24..32].copy_from_slice(&1u64.to_le_bytes());
    stat[32..40].copy_from_slice(&size.to_le_bytes());
    stat
}

fn list_sizes(mem: &mut dyn GuestMemory, list: &[String], count: Ptr, size: Ptr) -> Result<(), Errno> {
    let bytes: usize = list.iter().map(|s| s.len() + 1).sum();
    write_u32(mem, count, list.len() as u32)
        .and_then(|()| write_u32(mem, size, bytes as u32))
        .map_err(|_| errno::FAULT)
}

/// NUL-terminated strings packed into `buf`, with a pointer to each in `ptrs`.
fn write_list(mem: &mut dyn GuestMemory, list: &[String], ptrs: Ptr, buf: Ptr) -> Result<(), Errno> {
    let mut at = buf;
    for (i, s) in list.iter().enumerate() {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        write_u32(mem, ptrs + i as u32 * 4, at).map_err(|_| errno::FAULT)?;
        mem.write(at, &bytes).map_err(|_| errno::FAULT)?;
        at += bytes.len() as u32;
    }
    Ok(())
}

// ============================================================================
// Imports
// ============================================================================

/// Linear memory as a plain slice. WASI calls only read and write it.
struct SliceMemory<'a>(&'a mut [u8]);

impl SliceMemory<'_> {
    fn range(&self, ptr: Ptr, len: usize) -> Result<std::ops::Range<usize>, GuestError> {
        let start = ptr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.0.len() => Ok(start..end),
            _ => Err(GuestError::OutOfBounds { ptr, len }),
        }
    }
}

impl GuestMemory for SliceMemory<'_> {
    fn realloc(&mut self, _ptr: Ptr, _old_size: u32, _align: u32, _new_size: u32) -> Result<Ptr, GuestError> {
        Err(GuestError::Trap {
            context: WASI_MODULE.into(),
            message: "no allocation during a WASI call".into(),
        })
    }

    fn free(&mut self, _ptr: Ptr, _size: u32, _align: u32) -> Result<(), GuestError> {
        Err(GuestError::Trap {
            context: WASI_MODULE.into(),
            message: "no allocation during a WASI call".into(),
        })
    }

    fn read(&mut self, ptr: Ptr, buf: &mut [u8]) -> Result<(), GuestError> {
        let range = self.range(ptr, buf.len())?;
        buf.copy_from_slice(&self.0[range]);
        Ok(())
    }

    fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<(), GuestError> {
        let range = self.range(ptr, data.len())?;
        self.0[range].copy_from_slice(data);
        Ok(())
    }

    fn memory_size(&mut self) -> usize {
        self.0.len()
    }
}

/// Run `f` with the instance's WASI context and a view of its memory.
fn with_wasi<R>(
    caller: &mut Caller<'_, GuestState>,
    f: impl FnOnce(&mut WasiCtx, &mut dyn GuestMemory) -> R,
) -> wasmtime::Result<R> {
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest exports no memory"))?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    Ok(f(&mut state.wasi, &mut SliceMemory(data)))
}

/// Registers the supported `wasi_snapshot_preview1` functions.
pub struct WasiProvider;

type C<'a> = Caller<'a, GuestState>;

impl HostFunctionProvider<GuestState> for WasiProvider {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, GuestState>) -> Result<(), LinkerError> {
        builder
            .interface(WASI_MODULE)?
            .func_raw("args_sizes_get", |mut c: C<'_>, count: i32, size: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.args_sizes_get(m, count as Ptr, size as Ptr))
            })?
            .func_raw("args_get", |mut c: C<'_>, ptrs: i32, buf: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.args_get(m, ptrs as Ptr, buf as Ptr))
            })?
            .func_raw("environ_sizes_get", |mut c: C<'_>, count: i32, size: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.environ_sizes_get(m, count as Ptr, size as Ptr))
            })?
            .func_raw("environ_get", |mut c: C<'_>, ptrs: i32, buf: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.environ_get(m, ptrs as Ptr, buf as Ptr))
            })?
            .func_raw("fd_write", |mut c: C<'_>, fd: i32, iovs: i32, len: i32, out: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_write(m, fd, iovs as Ptr, len, out as Ptr))
            })?
            .func_raw("fd_read", |mut c: C<'_>, fd: i32, iovs: i32, len: i32, out: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_read(m, fd, iovs as Ptr, len, out as Ptr))
            })?
            .func_raw("fd_close", |mut c: C<'_>, fd: i32| -> i32 { c.data_mut().wasi.fd_close(fd) })?
            .func_raw("fd_seek", |mut c: C<'_>, fd: i32, offset: i64, whence: i32, out: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_seek(m, fd, offset, whence, out as Ptr))
            })?
            .func_raw("fd_tell", |mut c: C<'_>, fd: i32, out: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_tell(m, fd, out as Ptr))
            })?
            .func_raw("fd_filestat_get", |mut c: C<'_>, fd: i32, buf: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_filestat_get(m, fd, buf as Ptr))
            })?
            .func_raw("fd_fdstat_get", |mut c: C<'_>, fd: i32, buf: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_fdstat_get(m, fd, buf as Ptr))
            })?
            .func_raw("fd_fdstat_set_flags", |_: C<'_>, _fd: i32, _flags: i32| -> i32 {
                errno::SUCCESS
            })?
            .func_raw("fd_prestat_get", |mut c: C<'_>, fd: i32, buf: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_prestat_get(m, fd, buf as Ptr))
            })?
            .func_raw("fd_prestat_dir_name", |mut c: C<'_>, fd: i32, path: i32, len: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.fd_prestat_dir_name(m, fd, path as Ptr, len as u32))
            })?
            .func_raw(
                "path_open",
                |mut c: C<'_>,
                 dirfd: i32,
                 _dirflags: i32,
                 path: i32,
                 path_len: i32,
                 oflags: i32,
                 rights: i64,
                 _inheriting: i64,
                 fdflags: i32,
                 opened: i32|
                 -> wasmtime::Result<i32> {
                    with_wasi(&mut c, |w, m| {
                        w.path_open(m, dirfd, path as Ptr, path_len as u32, oflags, rights, fdflags, opened as Ptr)
                    })
                },
            )?
            .func_raw(
                "path_filestat_get",
                |mut c: C<'_>, dirfd: i32, _flags: i32, path: i32, len: i32, buf: i32| -> wasmtime::Result<i32> {
                    with_wasi(&mut c, |w, m| w.path_filestat_get(m, dirfd, path as Ptr, len as u32, buf as Ptr))
                },
            )?
            .func_raw("path_create_directory", |mut c: C<'_>, dirfd: i32, path: i32, len: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.path_create_directory(m, dirfd, path as Ptr, len as u32))
            })?
            .func_raw("path_remove_directory", |mut c: C<'_>, dirfd: i32, path: i32, len: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.path_remove_directory(m, dirfd, path as Ptr, len as u32))
            })?
            .func_raw("path_unlink_file", |mut c: C<'_>, dirfd: i32, path: i32, len: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.path_unlink_file(m, dirfd, path as Ptr, len as u32))
            })?
            .func_raw(
                "path_rename",
                |mut c: C<'_>, from_fd: i32, from: i32, from_len: i32, to_fd: i32, to: i32, to_len: i32| -> wasmtime::Result<i32> {
                    with_wasi(&mut c, |w, m| {
                        w.path_rename(m, from_fd, from as Ptr, from_len as u32, to_fd, to as Ptr, to_len as u32)
                    })
                },
            )?
            .func_raw("clock_time_get", |mut c: C<'_>, id: i32, _precision: i64, out: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.clock_time_get(m, id, out as Ptr))
            })?
            .func_raw("clock_res_get", |mut c: C<'_>, id: i32, out: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.clock_res_get(m, id, out as Ptr))
            })?
            .func_raw("random_get", |mut c: C<'_>, buf: i32, len: i32| -> wasmtime::Result<i32> {
                with_wasi(&mut c, |w, m| w.random_get(m, buf as Ptr, len as u32))
            })?
            .func_raw("sched_yield", |_: C<'_>| -> i32 { errno::SUCCESS })?
            .func_raw("proc_exit", |_: C<'_>, status: i32| -> wasmtime::Result<()> {
                Err(wasmtime::Error::new(ProcExit(status)))
            })?;
        Ok(())
    }
}
