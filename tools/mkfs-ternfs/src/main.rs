//! mkfs-ternfs -- create TernionOS filesystem images
//!
//! Host-side tool that packs a directory of files into the read-only
//! image the kernel mounts at boot (handed over as a multiboot module).
//!
//! The layout, all little-endian:
//!
//! ```text
//! Block 0:            boot block: num_dentries, num_inodes,
//!                     num_data_blocks (u32 each), 52 reserved bytes,
//!                     then up to 63 directory entries of 64 bytes:
//!                     (name[32], type u32, inode u32, reserved[24])
//! Blocks 1..1+I:      inodes: (length u32, data_block_index[1023] u32)
//! Blocks 1+I..:       raw 4 KiB data blocks
//! ```
//!
//! Entry types: 0 = RTC device, 1 = directory, 2 = regular file. The tool
//! always emits a `.` directory entry and an `rtc` device entry; inodes
//! are allocated for regular files only.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

const BLOCK_SIZE: usize = 4096;
const MAX_DENTRIES: usize = 63;
const MAX_FNAME_LEN: usize = 32;
const DENTRY_SIZE: usize = 64;
const MAX_BLOCKS_PER_INODE: usize = 1023;

const TYPE_RTC: u32 = 0;
const TYPE_DIRECTORY: u32 = 1;
const TYPE_FILE: u32 = 2;

/// Reserved entries emitted in every image: `.` and `rtc`.
const RESERVED_DENTRIES: usize = 2;

#[derive(Parser)]
#[command(about = "Create a TernionOS filesystem image from a directory")]
struct Args {
    /// Directory whose regular files populate the image
    input: PathBuf,

    /// Where to write the image
    #[arg(short, long, default_value = "ternfs.img")]
    output: PathBuf,
}

/// One file to be packed.
struct Input {
    name: Vec<u8>,
    content: Vec<u8>,
}

fn collect_inputs(dir: &Path) -> Result<Vec<Input>> {
    let mut inputs = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_str().context("file name is not valid UTF-8")?;
        if name.len() > MAX_FNAME_LEN {
            bail!("file name '{name}' exceeds {MAX_FNAME_LEN} bytes");
        }
        let content = fs::read(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        if content.len().div_ceil(BLOCK_SIZE) > MAX_BLOCKS_PER_INODE {
            bail!("file '{name}' does not fit in one inode");
        }
        inputs.push(Input {
            name: name.as_bytes().to_vec(),
            content,
        });
    }
    // Deterministic images: directory order is filesystem-dependent.
    inputs.sort_by(|a, b| a.name.cmp(&b.name));
    if RESERVED_DENTRIES + inputs.len() > MAX_DENTRIES {
        bail!(
            "too many files: {} given, {} fit",
            inputs.len(),
            MAX_DENTRIES - RESERVED_DENTRIES
        );
    }
    Ok(inputs)
}

fn write_dentry(image: &mut [u8], index: usize, name: &[u8], dtype: u32, inode: u32) {
    let base = DENTRY_SIZE + index * DENTRY_SIZE;
    image[base..base + name.len()].copy_from_slice(name);
    image[base + MAX_FNAME_LEN..base + MAX_FNAME_LEN + 4].copy_from_slice(&dtype.to_le_bytes());
    image[base + MAX_FNAME_LEN + 4..base + MAX_FNAME_LEN + 8]
        .copy_from_slice(&inode.to_le_bytes());
}

/// Lay the image out in memory.
fn build_image(inputs: &[Input]) -> Vec<u8> {
    let num_inodes = inputs.len();
    let num_data_blocks: usize = inputs
        .iter()
        .map(|f| f.content.len().div_ceil(BLOCK_SIZE))
        .sum();
    let total_blocks = 1 + num_inodes + num_data_blocks;
    let mut image = vec![0u8; total_blocks * BLOCK_SIZE];

    let num_dentries = (RESERVED_DENTRIES + inputs.len()) as u32;
    image[0..4].copy_from_slice(&num_dentries.to_le_bytes());
    image[4..8].copy_from_slice(&(num_inodes as u32).to_le_bytes());
    image[8..12].copy_from_slice(&(num_data_blocks as u32).to_le_bytes());

    write_dentry(&mut image, 0, b".", TYPE_DIRECTORY, 0);
    write_dentry(&mut image, 1, b"rtc", TYPE_RTC, 0);

    let mut next_data_block = 0u32;
    for (inode, input) in inputs.iter().enumerate() {
        write_dentry(
            &mut image,
            RESERVED_DENTRIES + inode,
            &input.name,
            TYPE_FILE,
            inode as u32,
        );

        let inode_base = (1 + inode) * BLOCK_SIZE;
        image[inode_base..inode_base + 4]
            .copy_from_slice(&(input.content.len() as u32).to_le_bytes());
        for (i, chunk) in input.content.chunks(BLOCK_SIZE).enumerate() {
            let slot = inode_base + 4 + i * 4;
            image[slot..slot + 4].copy_from_slice(&next_data_block.to_le_bytes());
            let data_base = (1 + num_inodes + next_data_block as usize) * BLOCK_SIZE;
            image[data_base..data_base + chunk.len()].copy_from_slice(chunk);
            next_data_block += 1;
        }
    }
    image
}

fn main() -> Result<()> {
    let args = Args::parse();
    let inputs = collect_inputs(&args.input)?;
    let image = build_image(&inputs);
    fs::write(&args.output, &image)
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!(
        "{}: {} files, {} blocks ({} bytes)",
        args.output.display(),
        inputs.len(),
        image.len() / BLOCK_SIZE,
        image.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(image: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap())
    }

    fn inputs(files: &[(&str, &[u8])]) -> Vec<Input> {
        files
            .iter()
            .map(|(n, c)| Input {
                name: n.as_bytes().to_vec(),
                content: c.to_vec(),
            })
            .collect()
    }

    #[test]
    fn header_counts_match_contents() {
        let image = build_image(&inputs(&[("a", b"x"), ("big", &[7u8; 5000])]));
        assert_eq!(read_u32(&image, 0), 4); // ., rtc, a, big
        assert_eq!(read_u32(&image, 4), 2); // two file inodes
        assert_eq!(read_u32(&image, 8), 3); // 1 + 2 data blocks
        assert_eq!(image.len(), (1 + 2 + 3) * BLOCK_SIZE);
    }

    #[test]
    fn reserved_entries_lead_the_directory() {
        let image = build_image(&inputs(&[("f", b"data")]));
        let first = DENTRY_SIZE;
        assert_eq!(&image[first..first + 1], b".");
        assert_eq!(read_u32(&image, first + 32), TYPE_DIRECTORY);
        let second = 2 * DENTRY_SIZE;
        assert_eq!(&image[second..second + 3], b"rtc");
        assert_eq!(read_u32(&image, second + 32), TYPE_RTC);
        let third = 3 * DENTRY_SIZE;
        assert_eq!(&image[third..third + 1], b"f");
        assert_eq!(read_u32(&image, third + 32), TYPE_FILE);
        assert_eq!(read_u32(&image, third + 36), 0); // first file inode
    }

    #[test]
    fn file_bytes_round_trip_through_the_layout() {
        let content: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let image = build_image(&inputs(&[("blob", &content)]));

        // Walk the inode's block table the way the kernel does.
        let inode_base = BLOCK_SIZE;
        let length = read_u32(&image, inode_base) as usize;
        assert_eq!(length, content.len());
        let data_base = 2 * BLOCK_SIZE; // one inode block
        let mut recovered = Vec::new();
        for i in 0..length.div_ceil(BLOCK_SIZE) {
            let block = read_u32(&image, inode_base + 4 + i * 4) as usize;
            let start = data_base + block * BLOCK_SIZE;
            let take = BLOCK_SIZE.min(length - recovered.len());
            recovered.extend_from_slice(&image[start..start + take]);
        }
        assert_eq!(recovered, content);
    }

    #[test]
    fn empty_directory_still_mounts() {
        let image = build_image(&[]);
        assert_eq!(read_u32(&image, 0), 2);
        assert_eq!(read_u32(&image, 4), 0);
        assert_eq!(image.len(), BLOCK_SIZE);
    }
}
