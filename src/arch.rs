/// Architecture gate: decides from an executable's header whether the agent can
/// be injected into it by this watcher build.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Target architecture of an executable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arch32,
    Arch64,
    /// Recognized image, but neither a native 32 nor 64 bit one
    /// (MS-DOS, 16 bit, foreign executable format, ...).
    Other,
    NotExecutable,
}

/// Relation between the watcher's architecture and a target's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// All 32 bit or all 64 bit.
    Same,
    /// One is 32 bit, the other 64 bit.
    Mixed,
    /// The host is always known (that's us); the target is not.
    TargetUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Elf,
    Pe,
}

#[cfg(windows)]
const NATIVE_FORMAT: ImageFormat = ImageFormat::Pe;
#[cfg(not(windows))]
const NATIVE_FORMAT: ImageFormat = ImageFormat::Elf;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PE_OFFSET_FIELD: usize = 0x3c;
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_DLL: u16 = 0x2000;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;

/// Architecture of the running watcher.
pub const fn host_arch() -> Arch {
    if cfg!(target_pointer_width = "64") {
        Arch::Arch64
    } else {
        Arch::Arch32
    }
}

/// Inspect the executable header at `path`. Never fails: anything that cannot
/// be opened or read as an executable image is [`Arch::NotExecutable`].
pub fn classify(path: &Path) -> Arch {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "cannot open target for classification");
            return Arch::NotExecutable;
        }
    };
    match read_image(&mut file) {
        Some((format, arch)) if format == NATIVE_FORMAT => arch,
        Some((format, _)) => {
            tracing::debug!(path = %path.display(), ?format, "foreign executable format");
            Arch::Other
        }
        None => Arch::NotExecutable,
    }
}

/// Format and architecture of an image, or `None` if it is not an executable.
fn read_image<R: Read + Seek>(image: &mut R) -> Option<(ImageFormat, Arch)> {
    let mut head = [0u8; 64];
    let len = read_up_to(image, &mut head)?;
    let head = &head[..len];

    if head.starts_with(ELF_MAGIC) {
        return elf_arch(head).map(|arch| (ImageFormat::Elf, arch));
    }
    if head.starts_with(b"MZ") {
        return pe_arch(image, head).map(|arch| (ImageFormat::Pe, arch));
    }
    None
}

fn elf_arch(head: &[u8]) -> Option<Arch> {
    if head.len() < 18 {
        return None;
    }
    let e_type = match head[5] {
        1 => u16::from_le_bytes([head[16], head[17]]),
        2 => u16::from_be_bytes([head[16], head[17]]),
        _ => return Some(Arch::Other),
    };
    if e_type != ET_EXEC && e_type != ET_DYN {
        return None;
    }
    Some(match head[4] {
        1 => Arch::Arch32,
        2 => Arch::Arch64,
        _ => Arch::Other,
    })
}

fn pe_arch<R: Read + Seek>(image: &mut R, head: &[u8]) -> Option<Arch> {
    if head.len() < PE_OFFSET_FIELD + 4 {
        // Too short to carry an extended header: plain MS-DOS image.
        return Some(Arch::Other);
    }
    let field = &head[PE_OFFSET_FIELD..PE_OFFSET_FIELD + 4];
    let offset = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);

    // signature(4) + COFF header(20) + optional header magic(2)
    let mut nt = [0u8; 26];
    image.seek(SeekFrom::Start(u64::from(offset))).ok()?;
    let len = read_up_to(image, &mut nt)?;
    if len < 4 || &nt[..4] != b"PE\0\0" {
        // NE / LE / LX or no extended header at all.
        return Some(Arch::Other);
    }
    if len < nt.len() {
        return None;
    }
    let characteristics = u16::from_le_bytes([nt[22], nt[23]]);
    if characteristics & IMAGE_FILE_EXECUTABLE_IMAGE == 0 || characteristics & IMAGE_FILE_DLL != 0 {
        return None;
    }
    Some(match u16::from_le_bytes([nt[24], nt[25]]) {
        PE32_MAGIC => Arch::Arch32,
        PE32_PLUS_MAGIC => Arch::Arch64,
        _ => Arch::Other,
    })
}

/// Fill as much of `buf` as the reader allows. `None` on I/O error.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Option<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return None,
        }
    }
    Some(filled)
}

/// `Same` iff the architectures are equal; an unknown target wins over a mismatch.
pub fn compatibility(host: Arch, target: Arch) -> Compatibility {
    if target == host {
        return Compatibility::Same;
    }
    match target {
        Arch::Other | Arch::NotExecutable => Compatibility::TargetUnknown,
        Arch::Arch32 | Arch::Arch64 => Compatibility::Mixed,
    }
}

/// Does the architecture of `target` match this watcher?
pub fn check(target: &Path) -> Compatibility {
    compatibility(host_arch(), classify(target))
}

fn bits(arch: Arch) -> &'static str {
    match arch {
        Arch::Arch32 => "32 bit",
        _ => "64 bit",
    }
}

/// One-line explanation of a verdict for the user.
pub fn explain(verdict: Compatibility, target: &Path) -> String {
    let host = host_arch();
    match verdict {
        Compatibility::Same => format!("Architectures match ({})", bits(host)),
        Compatibility::Mixed => {
            let other = if host == Arch::Arch64 { Arch::Arch32 } else { Arch::Arch64 };
            format!(
                "wintime is {}, but target ({}) is {}. Please use the {} version of wintime.",
                bits(host),
                target.display(),
                bits(other),
                bits(other)
            )
        }
        Compatibility::TargetUnknown => format!(
            "Target architecture (of {}) is neither native 32 bit nor 64 bit, but something else.",
            target.display()
        ),
    }
}
