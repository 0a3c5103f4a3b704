use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"PLNET001";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

/// Sink that only counts bytes; used to size an image without materializing it.
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f64_le<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// `(u64 length, f64 values)`; values keep their exact bit patterns.
pub fn write_f64_array<W: Write>(w: &mut W, values: &[f64]) -> io::Result<()> {
    write_u64_le(w, values.len() as u64)?;
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&buf)
}

/// `(u64 length, one byte per flag)`.
pub fn write_bool_array<W: Write>(w: &mut W, flags: &[bool]) -> io::Result<()> {
    write_u64_le(w, flags.len() as u64)?;
    let buf: Vec<u8> = flags.iter().map(|&b| u8::from(b)).collect();
    w.write_all(&buf)
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f64_le<R: Read>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_le_bytes(read_exact::<8, _>(r)?))
}

/// Reads a length prefix and checks it against the length the caller expects.
///
/// The check happens before any allocation so a corrupt prefix cannot trigger a huge
/// buffer.
pub fn read_array_len<R: Read>(r: &mut R, expected: usize, field: &str) -> io::Result<usize> {
    let n = read_u64_le(r)?;
    if n != expected as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{field}: expected {expected} entries, stream has {n}"),
        ));
    }
    Ok(expected)
}

pub fn read_f64_array<R: Read>(r: &mut R, expected: usize, field: &str) -> io::Result<Vec<f64>> {
    let n = read_array_len(r, expected, field)?;
    let byte_len = n.checked_mul(8).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{field}: {n} entries overflow the byte length"),
        )
    })?;
    let raw = read_body(r, byte_len)?;
    Ok(raw
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            f64::from_le_bytes(b)
        })
        .collect())
}

pub fn read_bool_array<R: Read>(r: &mut R, expected: usize, field: &str) -> io::Result<Vec<bool>> {
    let n = read_array_len(r, expected, field)?;
    let raw = read_body(r, n)?;
    Ok(raw.into_iter().map(|c| c != 0).collect())
}

/// Reads exactly `len` bytes, growing the buffer as data arrives so a corrupt length
/// cannot force a huge allocation up front.
fn read_body<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut raw)?;
    if raw.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "array body ended early",
        ));
    }
    Ok(raw)
}

/// Write a chunk: payload is LZ4-compressed and preceded by the uncompressed length (u32).
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Reads the body of a chunk whose header was just consumed and returns the
/// decompressed payload.
pub fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk shorter than its length prefix",
        ));
    }
    let uncompressed_len = read_u32_le(r)? as usize;
    let body_len = u64::from(len - 4);
    let mut compressed = Vec::new();
    r.by_ref().take(body_len).read_to_end(&mut compressed)?;
    if compressed.len() as u64 != body_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "chunk body ended early",
        ));
    }
    decompress_lz4(&compressed, uncompressed_len)
}
