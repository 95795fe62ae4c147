//! In-memory filesystem used to stage program text for `consult`.
//!
//! Paths are absolute and `/`-separated; `./foo` and `foo` resolve against
//! the root. Clones share the same tree, so a guest with a filesystem shim
//! can be handed a clone of the interpreter's store.

use crate::error::FsError;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub len: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }
}

/// Flags for [`MemoryFs::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, yes: bool) -> Self {
        self.read = yes;
        self
    }

    pub fn write(mut self, yes: bool) -> Self {
        self.write = yes;
        self
    }

    pub fn create(mut self, yes: bool) -> Self {
        self.create = yes;
        self
    }

    pub fn truncate(mut self, yes: bool) -> Self {
        self.truncate = yes;
        self
    }

    pub fn append(mut self, yes: bool) -> Self {
        self.append = yes;
        self
    }
}

/// Shared in-memory directory tree.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize to an absolute path without `.`/`..` segments or a trailing `/`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_child(dir: &str, path: &str) -> bool {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
    path.len() > prefix.len() && path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_parent(nodes: &BTreeMap<String, Node>, path: &str) -> Result<(), FsError> {
        let Some(dir) = parent(path) else {
            return Ok(());
        };
        match nodes.get(dir) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(FsError::NotADirectory(dir.to_string())),
            None => Err(FsError::NotFound(dir.to_string())),
        }
    }

    pub fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let path = normalize(path);
        let mut nodes = self.lock();
        if nodes.contains_key(&path) {
            return Err(FsError::Exists(path));
        }
        Self::check_parent(&nodes, &path)?;
        nodes.insert(path, Node::Dir);
        Ok(())
    }

    /// Like `create_dir`, creating missing parents; existing directories are fine.
    pub fn create_dir_all(&self, path: &str) -> Result<(), FsError> {
        let path = normalize(path);
        let mut nodes = self.lock();
        let mut at = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            at.push('/');
            at.push_str(seg);
            match nodes.get(&at) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(FsError::NotADirectory(at)),
                None => {
                    nodes.insert(at.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    pub fn open(&self, path: &str, opts: OpenOptions) -> Result<File, FsError> {
        let path = normalize(path);
        let mut nodes = self.lock();
        match nodes.get_mut(&path) {
            Some(Node::Dir) => return Err(FsError::IsADirectory(path)),
            Some(Node::File(data)) => {
                if opts.truncate && opts.write {
                    data.clear();
                }
            }
            None if opts.create => {
                Self::check_parent(&nodes, &path)?;
                nodes.insert(path.clone(), Node::File(Vec::new()));
            }
            None => return Err(FsError::NotFound(path)),
        }
        Ok(File {
            fs: self.clone(),
            path,
            pos: 0,
            opts,
        })
    }

    /// Whole contents of a file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize(path);
        match self.lock().get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    pub fn read_to_string(&self, path: &str) -> Result<String, FsError> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Create or replace a file.
    pub fn write(&self, path: &str, data: impl AsRef<[u8]>) -> Result<(), FsError> {
        let mut file = self.open(path, OpenOptions::new().write(true).create(true).truncate(true))?;
        file.write(data.as_ref())?;
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<(), FsError> {
        let path = normalize(path);
        let mut nodes = self.lock();
        match nodes.get(&path) {
            Some(Node::File(_)) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    pub fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        let path = normalize(path);
        let mut nodes = self.lock();
        match nodes.get(&path) {
            Some(Node::Dir) if path != "/" => {
                if nodes.keys().any(|k| is_child(&path, k)) {
                    return Err(FsError::NotEmpty(path));
                }
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(FsError::NotEmpty(path)),
            Some(Node::File(_)) => Err(FsError::NotADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Move a file or directory (with its contents). Replaces an existing
    /// file at the destination.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let from = normalize(from);
        let to = normalize(to);
        if from == to {
            return Ok(());
        }
        let mut nodes = self.lock();
        let node = nodes.get(&from).cloned().ok_or_else(|| FsError::NotFound(from.clone()))?;
        Self::check_parent(&nodes, &to)?;
        match (&node, nodes.get(&to)) {
            (_, Some(Node::Dir)) => return Err(FsError::Exists(to)),
            (Node::Dir, Some(Node::File(_))) => return Err(FsError::NotADirectory(to)),
            _ => {}
        }
        if matches!(node, Node::Dir) && to.starts_with(&format!("{from}/")) {
            return Err(FsError::Exists(to));
        }

        let prefix = format!("{from}/");
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(n) = nodes.remove(&key) {
                let dest = format!("{to}{}", &key[from.len()..]);
                nodes.insert(dest, n);
            }
        }
        Ok(())
    }

    pub fn stat(&self, path: &str) -> Result<Metadata, FsError> {
        let path = normalize(path);
        match self.lock().get(&path) {
            Some(Node::File(data)) => Ok(Metadata {
                file_type: FileType::File,
                len: data.len() as u64,
            }),
            Some(Node::Dir) => Ok(Metadata {
                file_type: FileType::Directory,
                len: 0,
            }),
            None => Err(FsError::NotFound(path)),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().contains_key(&normalize(path))
    }

    /// Names of the direct children of a directory, sorted.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = normalize(path);
        let nodes = self.lock();
        match nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::NotFound(path)),
        }
        Ok(nodes
            .keys()
            .filter(|k| is_child(&path, k))
            .filter_map(|k| k.rsplit('/').next().map(str::to_string))
            .collect())
    }
}

/// An open file with its own cursor.
#[derive(Debug)]
pub struct File {
    fs: MemoryFs,
    path: String,
    pos: usize,
    opts: OpenOptions,
}

impl File {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.opts.read {
            return Err(FsError::Access("reading"));
        }
        let nodes = self.fs.lock();
        let Some(Node::File(data)) = nodes.get(&self.path) else {
            return Err(FsError::NotFound(self.path.clone()));
        };
        let start = self.pos.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos = start + n;
        Ok(n)
    }

    pub fn read_to_string(&mut self) -> Result<String, FsError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if !self.opts.write && !self.opts.append {
            return Err(FsError::Access("writing"));
        }
        let mut nodes = self.fs.lock();
        let Some(Node::File(data)) = nodes.get_mut(&self.path) else {
            return Err(FsError::NotFound(self.path.clone()));
        };
        if self.opts.append {
            self.pos = data.len();
        }
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    pub fn write_str(&mut self, text: &str) -> Result<usize, FsError> {
        self.write(text.as_bytes())
    }

    pub fn len(&self) -> Result<u64, FsError> {
        Ok(self.fs.stat(&self.path)?.len)
    }

    pub fn is_empty(&self) -> Result<bool, FsError> {
        Ok(self.len()? == 0)
    }

    /// Move the cursor. Seeking past the end is allowed; a later write
    /// zero-fills the gap.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        let base = match pos {
            SeekFrom::Start(n) => Some(n as i64),
            SeekFrom::Current(n) => (self.pos as i64).checked_add(n),
            SeekFrom::End(n) => (self.len()? as i64).checked_add(n),
        };
        match base {
            Some(at) if at >= 0 => {
                self.pos = at as usize;
                Ok(at as u64)
            }
            _ => Err(FsError::InvalidSeek(self.path.clone())),
        }
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn options(&self) -> OpenOptions {
        self.opts
    }
}
