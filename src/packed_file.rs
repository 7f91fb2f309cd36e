//! Physical side of a cache insert: shifting packed bytes to open a hole.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Random access to the bytes of a packed cache file.
pub trait PackedFile {
    fn byte_len(&mut self) -> io::Result<u64>;
    fn set_byte_len(&mut self, len: u64) -> io::Result<()>;
    fn read_exact_at(&mut self, buf: &mut [u8], pos: u64) -> io::Result<()>;
    fn write_all_at(&mut self, buf: &[u8], pos: u64) -> io::Result<()>;
}

impl PackedFile for File {
    fn byte_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_byte_len(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn read_exact_at(&mut self, buf: &mut [u8], pos: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        self.read_exact(buf)
    }

    fn write_all_at(&mut self, buf: &[u8], pos: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        self.write_all(buf)
    }
}

impl PackedFile for Vec<u8> {
    fn byte_len(&mut self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn set_byte_len(&mut self, len: u64) -> io::Result<()> {
        self.resize(len as usize, 0);
        Ok(())
    }

    fn read_exact_at(&mut self, buf: &mut [u8], pos: u64) -> io::Result<()> {
        let start = pos as usize;
        let src = self
            .get(start..start + buf.len())
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_all_at(&mut self, buf: &[u8], pos: u64) -> io::Result<()> {
        let start = pos as usize;
        if self.len() < start + buf.len() {
            self.resize(start + buf.len(), 0);
        }
        self[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Writes `data` at physical offset `skip`, moving every byte from `skip` on
/// towards the end of the file by `data.len()`.
///
/// Bytes are moved back to front through a buffer of at most `shift_buffer`
/// bytes, so memory stays bounded however large the tail is.
pub fn shift_insert<F: PackedFile + ?Sized>(
    file: &mut F,
    skip: u64,
    data: &[u8],
    shift_buffer: usize,
) -> io::Result<()> {
    let len = data.len() as u64;
    let old_len = file.byte_len()?;
    let total_move = old_len.checked_sub(skip).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("insert offset {} beyond file length {}", skip, old_len),
        )
    })?;

    let temp_len = total_move.min(shift_buffer.max(1) as u64) as usize;
    let mut temp = vec![0u8; temp_len];
    file.set_byte_len(old_len + len)?;

    let mut moved = 0u64;
    while moved < total_move {
        let chunk = (total_move - moved).min(temp_len as u64);
        let from = old_len - moved - chunk;
        let temp = &mut temp[..chunk as usize];
        file.read_exact_at(temp, from)?;
        file.write_all_at(temp, from + len)?;
        moved += chunk;
    }

    file.write_all_at(data, skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_parts::CacheParts;

    /// Logical bytes are their own offset modulo 251, which makes misplaced
    /// bytes easy to spot.
    fn logical(start: u64, len: u64) -> Vec<u8> {
        (start..start + len).map(|i| (i % 251) as u8).collect()
    }

    fn insert(file: &mut Vec<u8>, parts: &CacheParts, start: u64, len: u64) -> CacheParts {
        let data = logical(start, len);
        let plan = parts
            .plan_insert(file.len() as u64, Some(10_000), start, len)
            .unwrap();
        shift_insert(file, plan.skip, &data[plan.data.clone()], 7).unwrap();
        plan.parts
    }

    #[test]
    fn shifts_tail_through_small_buffer() {
        let mut file = b"abcdef".to_vec();
        shift_insert(&mut file, 2, b"XYZ", 2).unwrap();
        assert_eq!(file, b"abXYZcdef");
    }

    #[test]
    fn appends_without_moving() {
        let mut file = b"abc".to_vec();
        shift_insert(&mut file, 3, b"de", 4).unwrap();
        assert_eq!(file, b"abcde");
    }

    #[test]
    fn rejects_offset_past_end() {
        let mut file = b"abc".to_vec();
        assert!(shift_insert(&mut file, 5, b"de", 4).is_err());
    }

    #[test]
    fn out_of_order_inserts_stay_packed() {
        let mut file = Vec::new();
        let mut parts = CacheParts::new();
        for (start, len) in [(500, 40), (0, 30), (200, 100), (30, 50), (300, 150), (80, 120)] {
            parts = insert(&mut file, &parts, start, len);
            assert_eq!(parts.cached_len(), file.len() as u64);
        }
        assert_eq!(parts.to_string(), "0-449,500-539");

        for part in parts.as_slice() {
            let span = parts.locate(part.start, part.len()).unwrap();
            let mut buf = vec![0u8; span.len as usize];
            file.read_exact_at(&mut buf, span.skip).unwrap();
            assert_eq!(buf, logical(part.start, part.len()));
        }
    }
}
