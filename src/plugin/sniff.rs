//! Extension guessing from the first bytes of a resource.
//!
//! Signatures are compared through integer views of the header window
//! rather than byte slices so a table entry can name a field at offset 4 or
//! 8 (container sub-types such as `RIFF....WAVE`).

use byteorder::{BigEndian, ByteOrder, LittleEndian};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    U32Le(usize),
    U32Be(usize),
    U16Le(usize),
    U16Be(usize),
}

impl View {
    fn read(self, header: &[u8]) -> Option<u32> {
        match self {
            View::U32Le(at) => header.get(at..at + 4).map(LittleEndian::read_u32),
            View::U32Be(at) => header.get(at..at + 4).map(BigEndian::read_u32),
            View::U16Le(at) => header.get(at..at + 2).map(|b| LittleEndian::read_u16(b) as u32),
            View::U16Be(at) => header.get(at..at + 2).map(|b| BigEndian::read_u16(b) as u32),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub view:      View,
    pub value:     u32,
    pub extension: &'static str,
}

const fn sig(view: View, value: u32, extension: &'static str) -> Signature {
    Signature { view, value, extension }
}

const fn tag(b: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*b)
}

/// Most specific first: offset-8 subtypes of RIFF precede anything at 0.
pub const SIGNATURES: &[Signature] = &[
    sig(View::U32Le(8), tag(b"WAVE"), "wav"),
    sig(View::U32Le(8), tag(b"WEBP"), "webp"),
    sig(View::U32Le(8), tag(b"AVI "), "avi"),
    sig(View::U32Le(4), tag(b"ftyp"), "mp4"),
    sig(View::U32Be(0), 0x8950_4E47, "png"),
    sig(View::U32Le(0), tag(b"DDS "), "dds"),
    sig(View::U32Le(0), tag(b"GIF8"), "gif"),
    sig(View::U32Le(0), tag(b"OggS"), "ogg"),
    sig(View::U32Le(0), tag(b"fLaC"), "flac"),
    sig(View::U32Le(0), tag(b"BKHD"), "bnk"),
    sig(View::U32Le(0), tag(b"FSB5"), "fsb"),
    sig(View::U32Le(0), tag(b"VAGp"), "vag"),
    sig(View::U32Le(0), tag(b"PK\x03\x04"), "zip"),
    sig(View::U32Le(0), tag(b"%PDF"), "pdf"),
    sig(View::U32Le(0), tag(b"\x7FELF"), "elf"),
    sig(View::U32Le(0), tag(b"<?xm"), "xml"),
    sig(View::U32Le(0), 0xFD2F_B528, "zst"),
    sig(View::U32Le(0), tag(b"PAK\0"), "pak"),
    sig(View::U32Le(0), tag(b"ZBLK"), "zblk"),
    sig(View::U32Le(0), tag(b"RIFF"), "riff"),
    sig(View::U16Be(0), 0xFFD8, "jpg"),
    sig(View::U16Be(0), 0x1F8B, "gz"),
    sig(View::U16Le(0), 0x4D42, "bmp"),
    sig(View::U16Le(0), 0x5A4D, "exe"),
];

/// First signature in `table` that matches `header`.
pub fn match_signature(header: &[u8], table: &[Signature]) -> Option<&'static str> {
    table
        .iter()
        .find(|s| s.view.read(header) == Some(s.value))
        .map(|s| s.extension)
}

/// [`SIGNATURES`] first, then "looks like text".
pub fn guess_from_magic(header: &[u8]) -> Option<&'static str> {
    match_signature(header, SIGNATURES).or_else(|| looks_like_text(header).then_some("txt"))
}

fn looks_like_text(header: &[u8]) -> bool {
    !header.is_empty()
        && header
            .iter()
            .all(|&b| b.is_ascii_graphic() || matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
}
