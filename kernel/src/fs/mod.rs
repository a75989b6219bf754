//! Read-only filesystem reader.
//!
//! The filesystem is a contiguous run of 4 KiB blocks handed over by the
//! boot loader and never modified. Block 0 is the boot block: a counts
//! header plus up to 63 directory entries. The next `num_inodes` blocks
//! are inodes (a byte length plus a table of data-block indices), and the
//! rest are raw data blocks.
//!
//! All multi-byte integers are little-endian. Every index and offset is
//! range-checked on every call: a corrupt image can fail a read, never
//! extend one.

use spin::Once;

use crate::fd::FdEntry;

pub const BLOCK_SIZE: usize = 4096;
/// Up to 63 directory entries fit after the 64-byte boot-block header.
pub const MAX_DENTRIES: usize = 63;
/// Names are NUL-padded; a 32-byte name has no terminator.
pub const MAX_FNAME_LEN: usize = 32;
pub const DENTRY_SIZE: usize = 64;
/// Data-block indices per inode after the 4-byte length field.
pub const MAX_BLOCKS_PER_INODE: usize = 1023;

/// Directory entry type tags as stored in the image.
pub const TYPE_RTC: u32 = 0;
pub const TYPE_DIRECTORY: u32 = 1;
pub const TYPE_FILE: u32 = 2;

/// A decoded directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dentry {
    pub name: [u8; MAX_FNAME_LEN],
    pub dtype: u32,
    pub inode: u32,
}

impl Dentry {
    /// The name bytes up to (not including) NUL padding. A maximum-length
    /// name has no terminator and comes back as all 32 bytes.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_FNAME_LEN);
        &self.name[..len]
    }
}

/// A parsed view over the in-memory image.
pub struct FsImage<'a> {
    data: &'a [u8],
    num_dentries: u32,
    num_inodes: u32,
    num_data_blocks: u32,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

impl<'a> FsImage<'a> {
    /// Parse and sanity-check an image. The kernel cannot run without its
    /// filesystem, so inconsistency is fatal.
    pub fn parse(data: &'a [u8]) -> FsImage<'a> {
        let total_blocks = data.len() / BLOCK_SIZE;
        if total_blocks < 1 {
            panic!("filesystem image smaller than one block");
        }
        let num_dentries = read_u32(data, 0);
        let num_inodes = read_u32(data, 4);
        let num_data_blocks = read_u32(data, 8);
        if num_dentries as usize > MAX_DENTRIES {
            panic!("boot block claims {num_dentries} directory entries");
        }
        if 1 + num_inodes as u64 + num_data_blocks as u64 > total_blocks as u64 {
            panic!("filesystem extends past the end of its module");
        }
        FsImage {
            data,
            num_dentries,
            num_inodes,
            num_data_blocks,
        }
    }

    pub fn num_dentries(&self) -> u32 {
        self.num_dentries
    }

    fn dentry_at(&self, index: u32) -> Dentry {
        let base = DENTRY_SIZE + index as usize * DENTRY_SIZE;
        let mut name = [0u8; MAX_FNAME_LEN];
        name.copy_from_slice(&self.data[base..base + MAX_FNAME_LEN]);
        Dentry {
            name,
            dtype: read_u32(self.data, base + MAX_FNAME_LEN),
            inode: read_u32(self.data, base + MAX_FNAME_LEN + 4),
        }
    }

    /// Linear boot-block scan. A query of exactly 32 bytes matches a
    /// non-terminated 32-byte name; anything longer matches nothing.
    pub fn dentry_by_name(&self, name: &[u8]) -> Option<Dentry> {
        if name.len() > MAX_FNAME_LEN {
            return None;
        }
        (0..self.num_dentries).map(|i| self.dentry_at(i)).find(|d| {
            if name.len() == MAX_FNAME_LEN {
                d.name == name
            } else {
                d.name[..name.len()] == *name && d.name[name.len()] == 0
            }
        })
    }

    /// Index lookup into the boot block.
    pub fn dentry_by_index(&self, index: u32) -> Option<Dentry> {
        if index >= self.num_dentries {
            return None;
        }
        Some(self.dentry_at(index))
    }

    /// Byte length of an inode's file.
    pub fn file_length(&self, inode: u32) -> Option<u32> {
        if inode >= self.num_inodes {
            return None;
        }
        Some(read_u32(self.data, (1 + inode as usize) * BLOCK_SIZE))
    }

    /// Copy up to `buf.len()` bytes from `inode` starting at `offset`.
    ///
    /// Returns the number of bytes copied (0 at or past end of file), or
    /// −1 for an out-of-range inode or a corrupt block index. Each
    /// iteration copies the minimum of the remaining buffer, the rest of
    /// the current 4 KiB block, and the rest of the file, so no step can
    /// overflow or run past either bound.
    pub fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> i32 {
        if inode >= self.num_inodes {
            return -1;
        }
        let inode_base = (1 + inode as usize) * BLOCK_SIZE;
        let file_length = read_u32(self.data, inode_base);
        let data_base = (1 + self.num_inodes as usize) * BLOCK_SIZE;

        let mut copied = 0usize;
        let mut offset = offset;
        while copied < buf.len() && offset < file_length {
            let table_index = (offset as usize) >> 12;
            if table_index >= MAX_BLOCKS_PER_INODE {
                // File length implies more blocks than an inode can hold.
                return -1;
            }
            let block = read_u32(self.data, inode_base + 4 + table_index * 4);
            if block >= self.num_data_blocks {
                return -1;
            }
            let start = offset as usize & (BLOCK_SIZE - 1);
            let count = (buf.len() - copied)
                .min(BLOCK_SIZE - start)
                .min((file_length - offset) as usize);
            let src = data_base + block as usize * BLOCK_SIZE + start;
            buf[copied..copied + count].copy_from_slice(&self.data[src..src + count]);
            copied += count;
            offset += count as u32;
        }
        copied as i32
    }
}

static FS: Once<FsImage<'static>> = Once::new();

/// Mount the image handed over at boot. Called once.
pub fn init(data: &'static [u8]) {
    let image = FsImage::parse(data);
    log::info!(
        "[FS] mounted: {} dentries, {} inodes, {} data blocks",
        image.num_dentries,
        image.num_inodes,
        image.num_data_blocks
    );
    FS.call_once(|| image);
}

/// The mounted image. Panics if the filesystem was never mounted.
pub fn image() -> &'static FsImage<'static> {
    FS.get().expect("filesystem not mounted")
}

/// Route an `open` by name to the driver the directory entry's type names.
/// The chosen driver variant is recorded on the descriptor here, at open
/// time. Device and directory entries must carry inode 0.
pub fn open_node(fd: &mut FdEntry, name: &[u8]) -> i32 {
    let Some(dentry) = image().dentry_by_name(name) else {
        return -1;
    };
    match dentry.dtype {
        TYPE_RTC => {
            if dentry.inode != 0 {
                return -1;
            }
            fd.driver = crate::fd::FdDriver::Rtc;
            crate::drivers::rtc::fd_open(fd)
        }
        TYPE_DIRECTORY => {
            if dentry.inode != 0 {
                return -1;
            }
            fd.driver = crate::fd::FdDriver::Directory;
            fd.inode = 0;
            fd.file_pos = 0;
            0
        }
        TYPE_FILE => {
            fd.driver = crate::fd::FdDriver::File;
            fd.inode = dentry.inode;
            fd.file_pos = 0;
            0
        }
        _ => -1,
    }
}

/// Regular-file read: copy from the current position and advance it.
pub fn file_read(fd: &mut FdEntry, buf: &mut [u8]) -> i32 {
    let copied = image().read_data(fd.inode, fd.file_pos, buf);
    if copied > 0 {
        fd.file_pos += copied as u32;
    }
    copied
}

/// Directory read: the next entry's raw name, up to 32 bytes, advancing by
/// one entry. Zero at the end of the directory. The name is returned
/// exactly as stored: NUL-padded, and *not* terminated when 32 bytes long.
pub fn directory_read(fd: &mut FdEntry, buf: &mut [u8]) -> i32 {
    let Some(dentry) = image().dentry_by_index(fd.file_pos) else {
        return 0;
    };
    fd.file_pos += 1;
    let count = buf.len().min(MAX_FNAME_LEN);
    buf[..count].copy_from_slice(&dentry.name[..count]);
    count as i32
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Build a synthetic image: given (name, type, content) triples,
    /// lay out a boot block, one inode per entry, and the data blocks.
    pub fn build_image(entries: &[(&[u8], u32, &[u8])]) -> alloc::vec::Vec<u8> {
        use alloc::vec;

        let num_inodes = entries.len();
        let blocks_per_entry: alloc::vec::Vec<usize> =
            entries.iter().map(|(_, _, c)| c.len().div_ceil(BLOCK_SIZE)).collect();
        let num_data_blocks: usize = blocks_per_entry.iter().sum();
        let total = 1 + num_inodes + num_data_blocks;
        let mut image = vec![0u8; total * BLOCK_SIZE];

        image[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        image[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
        image[8..12].copy_from_slice(&(num_data_blocks as u32).to_le_bytes());

        let mut next_data_block = 0u32;
        for (i, (name, dtype, content)) in entries.iter().enumerate() {
            let dbase = DENTRY_SIZE + i * DENTRY_SIZE;
            image[dbase..dbase + name.len()].copy_from_slice(name);
            image[dbase + 32..dbase + 36].copy_from_slice(&dtype.to_le_bytes());
            let inode = if *dtype == TYPE_FILE { i as u32 } else { 0 };
            image[dbase + 36..dbase + 40].copy_from_slice(&inode.to_le_bytes());

            let ibase = (1 + i) * BLOCK_SIZE;
            image[ibase..ibase + 4].copy_from_slice(&(content.len() as u32).to_le_bytes());
            for b in 0..blocks_per_entry[i] {
                let entry = ibase + 4 + b * 4;
                image[entry..entry + 4].copy_from_slice(&next_data_block.to_le_bytes());
                let dst = (1 + num_inodes + next_data_block as usize) * BLOCK_SIZE;
                let chunk = &content[b * BLOCK_SIZE..content.len().min((b + 1) * BLOCK_SIZE)];
                image[dst..dst + chunk.len()].copy_from_slice(chunk);
                next_data_block += 1;
            }
        }
        image
    }

    extern crate alloc;

    fn sample() -> alloc::vec::Vec<u8> {
        let long_name: &[u8] = b"abcdefghijklmnopqrstuvwxyz012345"; // exactly 32
        build_image(&[
            (&b"."[..], TYPE_DIRECTORY, &b""[..]),
            (&b"rtc"[..], TYPE_RTC, &b""[..]),
            (&b"frame0.txt"[..], TYPE_FILE, &b"hello from frame0\n"[..]),
            (long_name, TYPE_FILE, &[0xAAu8; 5000][..]),
        ])
    }

    #[test]
    fn lookup_by_name_and_index_agree() {
        let data = sample();
        let fs = FsImage::parse(&data);
        let by_name = fs.dentry_by_name(b"frame0.txt").unwrap();
        let by_index = fs.dentry_by_index(2).unwrap();
        assert_eq!(by_name, by_index);
        assert_eq!(by_name.dtype, TYPE_FILE);
        assert!(fs.dentry_by_index(4).is_none());
    }

    #[test]
    fn full_length_names_match_only_full_length_queries() {
        let data = sample();
        let fs = FsImage::parse(&data);
        let long = b"abcdefghijklmnopqrstuvwxyz012345";
        assert!(fs.dentry_by_name(long).is_some());
        // A 31-byte prefix must not match the 32-byte name.
        assert!(fs.dentry_by_name(&long[..31]).is_none());
        // Nor may anything longer than 32 bytes match at all.
        let mut too_long = [0u8; 33];
        too_long[..32].copy_from_slice(long);
        too_long[32] = b'!';
        assert!(fs.dentry_by_name(&too_long).is_none());
    }

    #[test]
    fn read_clamps_to_file_length() {
        let data = sample();
        let fs = FsImage::parse(&data);
        let d = fs.dentry_by_name(b"frame0.txt").unwrap();
        let len = fs.file_length(d.inode).unwrap() as usize;

        // Asking for more than the file holds copies exactly the file.
        let mut buf = [0xFFu8; 64];
        assert_eq!(fs.read_data(d.inode, 0, &mut buf[..len + 10]) as usize, len);
        assert_eq!(&buf[..len], b"hello from frame0\n");
        // And nothing beyond the returned count was touched.
        assert!(buf[len..].iter().all(|&b| b == 0xFF));

        // At end of file a further read is empty.
        assert_eq!(fs.read_data(d.inode, len as u32, &mut buf), 0);
        // Offsets past the end are clamped the same way.
        assert_eq!(fs.read_data(d.inode, u32::MAX, &mut buf), 0);
    }

    #[test]
    fn read_crosses_block_boundaries() {
        let data = sample();
        let fs = FsImage::parse(&data);
        let d = fs.dentry_by_name(b"abcdefghijklmnopqrstuvwxyz012345").unwrap();

        let mut buf = alloc::vec![0u8; 5000];
        assert_eq!(fs.read_data(d.inode, 0, &mut buf), 5000);
        assert!(buf.iter().all(|&b| b == 0xAA));

        // A read straddling the 4096-byte boundary stays correct.
        let mut window = [0u8; 64];
        assert_eq!(fs.read_data(d.inode, 4090, &mut window), 64);
        assert!(window.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn read_rejects_bad_inodes_and_corrupt_block_indices() {
        let data = sample();
        let fs = FsImage::parse(&data);
        let mut buf = [0u8; 8];
        assert_eq!(fs.read_data(99, 0, &mut buf), -1);

        // Corrupt the long file's first block index to point past the end.
        let mut corrupt = sample();
        let d = FsImage::parse(&corrupt)
            .dentry_by_name(b"abcdefghijklmnopqrstuvwxyz012345")
            .unwrap();
        let ibase = (1 + d.inode as usize) * BLOCK_SIZE;
        corrupt[ibase + 4..ibase + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        let fs = FsImage::parse(&corrupt);
        assert_eq!(fs.read_data(d.inode, 0, &mut buf), -1);
    }

    #[test]
    #[should_panic(expected = "smaller than one block")]
    fn parse_rejects_truncated_images() {
        let data = [0u8; 100];
        let _ = FsImage::parse(&data);
    }

    #[test]
    #[should_panic(expected = "past the end")]
    fn parse_rejects_inconsistent_counts() {
        let mut data = alloc::vec![0u8; BLOCK_SIZE];
        data[4..8].copy_from_slice(&100u32.to_le_bytes());
        let _ = FsImage::parse(&data);
    }
}
