#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use fvm_block::{ByteTransport, FileByteDevice};
use fvm_core::VPartitionManager;
use fvm_types::{Guid, Vslice};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_BLOCK_SIZE: u32 = 512;

#[derive(Debug, Serialize)]
struct PartitionReport {
    index: u16,
    name: String,
    type_guid: String,
    guid: String,
    slices: u64,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    slice_size: u64,
    pslice_count: u64,
    free_slices: u64,
    metadata_size: u64,
    generation: u64,
    current_copy: String,
    partitions: Vec<PartitionReport>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "format" => {
            let Some(path) = args.next() else {
                bail!("format requires an image path");
            };
            let rest: Vec<String> = args.collect();
            let slice_size = flag_value(&rest, "--slice-size")?
                .map(parse_size)
                .transpose()?
                .unwrap_or(1 << 20);
            let size = flag_value(&rest, "--size")?.map(parse_size).transpose()?;
            format_cmd(Path::new(&path), slice_size, size)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect_cmd(Path::new(&path), json)
        }
        "add" => {
            let Some(path) = args.next() else {
                bail!("add requires <image-path> <name> <slices>");
            };
            let Some(name) = args.next() else {
                bail!("add requires <image-path> <name> <slices>");
            };
            let Some(slices) = args.next() else {
                bail!("add requires <image-path> <name> <slices>");
            };
            let rest: Vec<String> = args.collect();
            let type_guid = flag_value(&rest, "--type-guid")?
                .map(parse_guid)
                .transpose()?
                .unwrap_or(Guid::ZERO);
            let guid = flag_value(&rest, "--guid")?
                .map(parse_guid)
                .transpose()?
                .unwrap_or(Guid::ZERO);
            add_cmd(
                Path::new(&path),
                &name,
                parse_size(slices)?,
                type_guid,
                guid,
            )
        }
        "extend" => {
            let (path, name, offset, length) = take4(&mut args, "extend")?;
            extend_cmd(
                Path::new(&path),
                &name,
                parse_size(offset)?,
                parse_size(length)?,
            )
        }
        "shrink" => {
            let (path, name, offset, length) = take4(&mut args, "shrink")?;
            shrink_cmd(
                Path::new(&path),
                &name,
                parse_size(offset)?,
                parse_size(length)?,
            )
        }
        "destroy" => {
            let Some(path) = args.next() else {
                bail!("destroy requires <image-path> <name>");
            };
            let Some(name) = args.next() else {
                bail!("destroy requires <image-path> <name>");
            };
            destroy_cmd(Path::new(&path), &name)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("fvm-cli\n");
    println!("USAGE:");
    println!("  fvm-cli format <image-path> [--slice-size <bytes>] [--size <bytes>]");
    println!("  fvm-cli inspect <image-path> [--json]");
    println!("  fvm-cli add <image-path> <name> <slices> [--type-guid <guid>] [--guid <guid>]");
    println!("  fvm-cli extend <image-path> <name> <vslice-offset> <count>");
    println!("  fvm-cli shrink <image-path> <name> <vslice-offset> <count>");
    println!("  fvm-cli destroy <image-path> <name>");
}

fn take4(
    args: &mut impl Iterator<Item = String>,
    command: &str,
) -> Result<(String, String, String, String)> {
    match (args.next(), args.next(), args.next(), args.next()) {
        (Some(a), Some(b), Some(c), Some(d)) => Ok((a, b, c, d)),
        _ => bail!("{command} requires <image-path> <name> <vslice-offset> <count>"),
    }
}

/// Find `--flag value` in the trailing arguments.
fn flag_value(rest: &[String], flag: &str) -> Result<Option<String>> {
    match rest.iter().position(|arg| arg == flag) {
        None => Ok(None),
        Some(i) => rest
            .get(i + 1)
            .cloned()
            .map(Some)
            .with_context(|| format!("{flag} requires a value")),
    }
}

/// Parse a decimal count, allowing k/m/g suffixes.
fn parse_size(raw: impl AsRef<str>) -> Result<u64> {
    let raw = raw.as_ref();
    let (digits, shift) = match raw.to_ascii_lowercase() {
        s if s.ends_with('k') => (s[..s.len() - 1].to_string(), 10),
        s if s.ends_with('m') => (s[..s.len() - 1].to_string(), 20),
        s if s.ends_with('g') => (s[..s.len() - 1].to_string(), 30),
        s => (s, 0),
    };
    let base: u64 = digits
        .parse()
        .with_context(|| format!("invalid number: {raw}"))?;
    base.checked_shl(shift)
        .filter(|v| v >> shift == base)
        .with_context(|| format!("size overflows u64: {raw}"))
}

/// Parse a GUID in canonical dashed form or as 32 bare hex digits.
fn parse_guid(raw: impl AsRef<str>) -> Result<Guid> {
    let raw = raw.as_ref();
    let hex: String = raw.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        bail!("invalid GUID (expected 32 hex digits): {raw}");
    }
    let mut bytes = [0_u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .with_context(|| format!("invalid GUID: {raw}"))?;
    }
    Ok(Guid(bytes))
}

fn open_manager(path: &Path) -> Result<Arc<VPartitionManager>> {
    let dev = FileByteDevice::open(path, DEFAULT_BLOCK_SIZE)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let transport = ByteTransport::new(dev).context("image is not block-aligned")?;
    VPartitionManager::load(Arc::new(transport))
        .with_context(|| format!("failed to load volume manager from {}", path.display()))
}

fn find_partition(
    fvm: &VPartitionManager,
    name: &str,
) -> Result<Arc<fvm_core::VPartition>> {
    fvm.partitions()
        .into_iter()
        .find(|vp| {
            vp.identity()
                .map(|identity| identity.name == name)
                .unwrap_or(false)
        })
        .with_context(|| format!("no partition named {name:?}"))
}

fn format_cmd(path: &Path, slice_size: u64, size: Option<u64>) -> Result<()> {
    if let Some(size) = size {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to create image: {}", path.display()))?;
        file.set_len(size).context("failed to size image")?;
    }
    let dev = FileByteDevice::open(path, DEFAULT_BLOCK_SIZE)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let geometry = VPartitionManager::format(&dev, slice_size).context("format failed")?;
    println!(
        "formatted: slice_size={} pslice_count={} metadata_size={}",
        geometry.slice_size, geometry.pslice_count, geometry.metadata_size
    );
    Ok(())
}

fn inspect_cmd(path: &Path, json: bool) -> Result<()> {
    let fvm = open_manager(path)?;
    let geometry = fvm.geometry();

    let mut partitions = Vec::new();
    for vp in fvm.partitions() {
        let identity = vp.identity().context("partition vanished")?;
        partitions.push(PartitionReport {
            index: identity.index.0,
            name: identity.name,
            type_guid: identity.type_guid.to_string(),
            guid: identity.guid.to_string(),
            slices: vp.slice_count(),
        });
    }
    let output = InspectOutput {
        slice_size: geometry.slice_size,
        pslice_count: geometry.pslice_count,
        free_slices: fvm.free_slice_count().context("scan allocation table")?,
        metadata_size: geometry.metadata_size,
        generation: fvm.generation().0,
        current_copy: format!("{:?}", fvm.current_copy()),
        partitions,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("slice_size: {}", output.slice_size);
        println!("pslice_count: {}", output.pslice_count);
        println!("free_slices: {}", output.free_slices);
        println!("metadata_size: {}", output.metadata_size);
        println!("generation: {}", output.generation);
        println!("current_copy: {}", output.current_copy);
        println!("partitions: {}", output.partitions.len());
        for p in &output.partitions {
            println!(
                "  [{}] {} slices={} type={} guid={}",
                p.index, p.name, p.slices, p.type_guid, p.guid
            );
        }
    }
    Ok(())
}

fn add_cmd(path: &Path, name: &str, slices: u64, type_guid: Guid, guid: Guid) -> Result<()> {
    let fvm = open_manager(path)?;
    let vp = fvm
        .allocate_partition(type_guid, guid, name, slices)
        .with_context(|| format!("failed to create partition {name:?}"))?;
    let index = vp.entry_index().context("partition vanished")?;
    println!("created partition {name:?} at index {index} with {slices} slices");
    Ok(())
}

fn extend_cmd(path: &Path, name: &str, offset: u64, length: u64) -> Result<()> {
    let fvm = open_manager(path)?;
    let vp = find_partition(&fvm, name)?;
    fvm.extend(&vp, Vslice(offset), length)
        .with_context(|| format!("failed to extend {name:?}"))?;
    println!("extended {name:?} by {length} slices at vslice {offset}");
    Ok(())
}

fn shrink_cmd(path: &Path, name: &str, offset: u64, length: u64) -> Result<()> {
    let fvm = open_manager(path)?;
    let vp = find_partition(&fvm, name)?;
    fvm.shrink(&vp, Vslice(offset), length)
        .with_context(|| format!("failed to shrink {name:?}"))?;
    println!("freed {length} slices of {name:?} at vslice {offset}");
    Ok(())
}

fn destroy_cmd(path: &Path, name: &str) -> Result<()> {
    let fvm = open_manager(path)?;
    let vp = find_partition(&fvm, name)?;
    fvm.destroy(&vp)
        .with_context(|| format!("failed to destroy {name:?}"))?;
    println!("destroyed {name:?}");
    Ok(())
}
