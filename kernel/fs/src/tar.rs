//! Read-only tar filesystem backing the initrd.
//!
//! The archive is a ustar byte image linked into the kernel. Inode
//! numbers are assigned by walking the archive once at mount time: the
//! implicit archive root is inode 2, each entry consumes the next number,
//! and one further number is consumed per `/` in its path so intermediate
//! directories are addressable even when the archive never records them
//! explicitly (the k-th extra number names the prefix ending at the k-th
//! slash, first sighting wins). All mutation returns `not_permitted`.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use tern_core::errno::Errno;
use tern_core::sync::IntLock;

use crate::PATH_NAME_MAX;
use crate::cache::InodeCache;
use crate::inode::{Filesystem, Inode, InodeMeta, InodeNum};
use crate::mode::{S_IFDIR, S_IFREG};

const BLOCK: usize = 512;
const NAME_OFFSET: usize = 0;
const MODE_OFFSET: usize = 100;
const UID_OFFSET: usize = 108;
const GID_OFFSET: usize = 116;
const SIZE_OFFSET: usize = 124;
const TYPE_OFFSET: usize = 156;
const MAGIC_OFFSET: usize = 257;

/// Parses a NUL/space-terminated octal field.
fn parse_oct(field: &[u8]) -> u32 {
    let mut n = 0u32;
    for &b in field {
        match b {
            b'0'..=b'7' => n = (n << 3) + u32::from(b - b'0'),
            b' ' => continue,
            _ => break,
        }
    }
    n
}

/// One addressable object in the archive.
struct TarNode {
    num: InodeNum,
    /// Trimmed path: no leading `./`, no trailing `/`; empty for root.
    path: String,
    mode: u16,
    uid: u32,
    gid: u32,
    /// Payload location within the archive; empty for directories.
    data_offset: usize,
    size: usize,
}

/// The tar filesystem.
pub struct TarFs {
    archive: &'static [u8],
    nodes: Vec<TarNode>,
    cache: IntLock<InodeCache>,
}

impl TarFs {
    /// Walks the archive headers and builds the inode-number table.
    #[must_use]
    pub fn new(archive: &'static [u8]) -> Arc<Self> {
        let mut nodes = Vec::new();
        nodes.push(TarNode {
            num: InodeNum::ROOT,
            path: String::new(),
            mode: S_IFDIR | 0o555,
            uid: 0,
            gid: 0,
            data_offset: 0,
            size: 0,
        });

        let mut next = InodeNum::ROOT.0 + 1;
        let mut offset = 0;
        while offset + BLOCK <= archive.len()
            && &archive[offset + MAGIC_OFFSET..offset + MAGIC_OFFSET + 5] == b"ustar"
        {
            let header = &archive[offset..offset + BLOCK];
            let size = parse_oct(&header[SIZE_OFFSET..SIZE_OFFSET + 11]) as usize;

            let name_field = &header[NAME_OFFSET..NAME_OFFSET + 100];
            let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(100);
            let raw = core::str::from_utf8(&name_field[..name_len]).unwrap_or("");
            let path = raw
                .trim_start_matches("./")
                .trim_end_matches('/')
                .to_string();

            let entry_num = next;
            let slashes = path.bytes().filter(|&b| b == b'/').count() as u32;
            next += 1 + slashes;

            if !path.is_empty() && !Self::path_known(&nodes, &path) {
                let is_dir = header[TYPE_OFFSET] == b'5';
                nodes.push(TarNode {
                    num: InodeNum(entry_num),
                    path: path.clone(),
                    mode: (if is_dir { S_IFDIR } else { S_IFREG })
                        | (parse_oct(&header[MODE_OFFSET..MODE_OFFSET + 8]) & 0o7777) as u16,
                    uid: parse_oct(&header[UID_OFFSET..UID_OFFSET + 8]),
                    gid: parse_oct(&header[GID_OFFSET..GID_OFFSET + 8]),
                    data_offset: offset + BLOCK,
                    size: if is_dir { 0 } else { size },
                });
            }

            // The extra numbers name this entry's directory prefixes.
            for (k, (pos, _)) in path.match_indices('/').enumerate() {
                let prefix = &path[..pos];
                if !Self::path_known(&nodes, prefix) {
                    #[allow(clippy::cast_possible_truncation)]
                    nodes.push(TarNode {
                        num: InodeNum(entry_num + 1 + k as u32),
                        path: prefix.to_string(),
                        mode: S_IFDIR | 0o555,
                        uid: 0,
                        gid: 0,
                        data_offset: 0,
                        size: 0,
                    });
                }
            }

            offset += (size.div_ceil(BLOCK) + 1) * BLOCK;
        }

        Arc::new(Self {
            archive,
            nodes,
            cache: IntLock::new(InodeCache::new()),
        })
    }

    fn path_known(nodes: &[TarNode], path: &str) -> bool {
        nodes.iter().any(|n| n.path == path)
    }

    fn node_by_num(&self, num: InodeNum) -> Option<&TarNode> {
        self.nodes.iter().find(|n| n.num == num)
    }

    fn node_by_path(&self, path: &str) -> Option<&TarNode> {
        self.nodes.iter().find(|n| n.path == path)
    }
}

impl Filesystem for TarFs {
    fn lookup(&self, dir: &Inode, name: &str) -> Result<InodeNum, Errno> {
        let dir_node = self.node_by_num(dir.num()).ok_or(Errno::NoEntry)?;

        if dir_node.path.len() + 1 + name.len() + 1 > PATH_NAME_MAX {
            return Err(Errno::PathTooLong);
        }
        let full = if dir_node.path.is_empty() {
            name.to_string()
        } else {
            alloc::format!("{}/{}", dir_node.path, name)
        };

        self.node_by_path(&full).map(|n| n.num).ok_or(Errno::NoEntry)
    }

    fn read_inode(&self, num: InodeNum) -> Result<InodeMeta, Errno> {
        let node = self.node_by_num(num).ok_or(Errno::NoEntry)?;
        Ok(InodeMeta {
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            nlink: 1,
            size: node.size as u64,
            dev: 0,
        })
    }

    fn read_at(&self, inode: &Inode, buf: &mut [u8], pos: u64) -> Result<usize, Errno> {
        let node = self.node_by_num(inode.num()).ok_or(Errno::NoEntry)?;
        if pos >= node.size as u64 {
            return Ok(0);
        }
        #[allow(clippy::cast_possible_truncation)]
        let pos = pos as usize;
        let n = buf.len().min(node.size - pos);
        let data = &self.archive[node.data_offset + pos..node.data_offset + pos + n];
        buf[..n].copy_from_slice(data);
        Ok(n)
    }

    fn cache(&self) -> &IntLock<InodeCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileMode;
    use crate::vfs::Vfs;

    /// Appends one ustar entry. `typeflag` b'0' for files, b'5' for
    /// directories.
    fn push_entry(out: &mut Vec<u8>, name: &str, content: &[u8], typeflag: u8) {
        let mut header = [0u8; BLOCK];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[MODE_OFFSET..MODE_OFFSET + 8].copy_from_slice(b"0000644\0");
        header[UID_OFFSET..UID_OFFSET + 8].copy_from_slice(b"0001750\0");
        header[GID_OFFSET..GID_OFFSET + 8].copy_from_slice(b"0001750\0");
        let size = format!("{:011o}\0", content.len());
        header[SIZE_OFFSET..SIZE_OFFSET + 12].copy_from_slice(size.as_bytes());
        header[TYPE_OFFSET] = typeflag;
        header[MAGIC_OFFSET..MAGIC_OFFSET + 6].copy_from_slice(b"ustar\0");
        out.extend_from_slice(&header);

        out.extend_from_slice(content);
        let pad = content.len().div_ceil(BLOCK) * BLOCK - content.len();
        out.extend_from_slice(&vec![0u8; pad]);
    }

    fn sample_archive() -> &'static [u8] {
        let mut out = Vec::new();
        push_entry(&mut out, "hello.txt", b"hello from the initrd\n", b'0');
        push_entry(&mut out, "foo/bar.txt", b"nested", b'0');
        // Two zero blocks terminate a tar archive.
        out.extend_from_slice(&[0u8; 2 * BLOCK]);
        Vec::leak(out)
    }

    fn mounted() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.mount("/", TarFs::new(sample_archive())).unwrap();
        vfs
    }

    #[test]
    fn inode_numbering() {
        // Root is 2 (implicit). hello.txt takes 3; foo/bar.txt takes 4
        // and its one slash reserves 5, which names the `foo` prefix.
        let vfs = mounted();
        assert_eq!(vfs.traverse("/").unwrap().num(), InodeNum(2));
        assert_eq!(vfs.traverse("/hello.txt").unwrap().num(), InodeNum(3));
        assert_eq!(vfs.traverse("/foo/bar.txt").unwrap().num(), InodeNum(4));
        assert_eq!(vfs.traverse("/foo").unwrap().num(), InodeNum(5));
    }

    #[test]
    fn traverse_and_read() {
        let vfs = mounted();
        let inode = vfs.traverse("/hello.txt").unwrap();
        assert!(crate::mode::is_reg(inode.meta.mode));
        assert_eq!(inode.meta.size, 22);
        assert_eq!(inode.meta.uid, 0o1750);

        let file = inode.open(FileMode::READ).unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(file.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello from ");
        assert_eq!(file.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"the initrd\n");
        assert_eq!(file.read(&mut buf).unwrap(), 0, "cursor hit EOF");

        // pread does not move the cursor.
        let mut head = [0u8; 5];
        assert_eq!(file.pread(&mut head, 0).unwrap(), 5);
        assert_eq!(&head, b"hello");
        assert_eq!(file.pos(), 22);
    }

    #[test]
    fn missing_paths() {
        let vfs = mounted();
        assert_eq!(vfs.traverse("/does/not/exist").unwrap_err(), Errno::NoEntry);
        assert_eq!(vfs.traverse("/foo/missing").unwrap_err(), Errno::NoEntry);
    }

    #[test]
    fn synthesized_directories() {
        let vfs = mounted();
        let foo = vfs.traverse("/foo").unwrap();
        assert!(crate::mode::is_dir(foo.meta.mode));
        // Lookup continues through the synthesized directory.
        assert_eq!(foo.lookup("bar.txt").unwrap(), InodeNum(4));
    }

    #[test]
    fn explicit_directory_entries_take_their_own_number() {
        let mut out = Vec::new();
        push_entry(&mut out, "dir/", &[], b'5');
        push_entry(&mut out, "dir/file", b"x", b'0');
        out.extend_from_slice(&[0u8; 2 * BLOCK]);

        let mut vfs = Vfs::new();
        vfs.mount("/", TarFs::new(Vec::leak(out))).unwrap();

        // "dir/" is entry 3; "dir/file" is 4 and its reserved 5 goes
        // unused because the prefix is already known.
        assert_eq!(vfs.traverse("/dir").unwrap().num(), InodeNum(3));
        assert_eq!(vfs.traverse("/dir/file").unwrap().num(), InodeNum(4));
    }

    #[test]
    fn mutation_is_not_permitted() {
        let vfs = mounted();
        let root = vfs.traverse("/").unwrap();
        assert_eq!(root.create("new.txt", 0o644).unwrap_err(), Errno::NotPermitted);
        assert_eq!(root.unlink("hello.txt").unwrap_err(), Errno::NotPermitted);

        let file = vfs.traverse("/hello.txt").unwrap().open(FileMode::WRITE).unwrap();
        assert_eq!(file.write(b"nope").unwrap_err(), Errno::NotPermitted);
    }

    #[test]
    fn refcount_discipline_across_open() {
        let vfs = mounted();
        let inode = vfs.traverse("/hello.txt").unwrap();
        assert_eq!(Arc::strong_count(&inode), 1);

        let file = inode.open(FileMode::READ).unwrap();
        assert_eq!(Arc::strong_count(&inode), 2, "open takes a reference");

        drop(file);
        assert_eq!(Arc::strong_count(&inode), 1, "close releases it");

        // Releasing the last reference evicts the inode; a fresh
        // traversal instantiates a new object with the same number.
        drop(inode);
        let again = vfs.traverse("/hello.txt").unwrap();
        assert_eq!(again.num(), InodeNum(3));
        assert_eq!(Arc::strong_count(&again), 1);
    }

    #[test]
    fn octal_parsing() {
        assert_eq!(parse_oct(b"0000644\0"), 0o644);
        assert_eq!(parse_oct(b" 644\0"), 0o644);
        assert_eq!(parse_oct(b"00000000026"), 22);
        assert_eq!(parse_oct(b"\0\0\0"), 0);
    }
}
