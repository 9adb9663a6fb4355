use std::io::Read;

use crate::{error, item::{ClassFileItem, ConstantPool}};

/// A utility wrapper to allow easily reading class file types from a [Reader](std::io::Read).
pub struct ClassFileStream<'a, R: Read>(pub &'a mut R, pub usize);

impl<'a, R: Read> ClassFileStream<'a, R> {

    /// Create a new stream from a reader.
    pub fn new(r: &'a mut R) -> Self {
        Self(r, 0)
    }

    /// Read a sequence of `length` `T`s from this stream.
    pub fn read_sequence<T: ClassFileItem>(&mut self, constant_pool: Option<&ConstantPool>, length: usize) -> error::Result<Vec<T>> {
        let mut v = Vec::with_capacity(length);
        for _ in 0..length {
            v.push(T::read_from_stream(self, constant_pool)?);
        }
        Ok(v)
    }

    /// Read an unsigned 4-byte integer from the stream.
    pub fn read_u4(&mut self) -> error::Result<u32> {
        Ok(u32::from_be_bytes(self.read::<4>()?))
    }

    /// Read an unsigned 2-byte integer from the stream.
    pub fn read_u2(&mut self) -> error::Result<u16> {
        Ok(u16::from_be_bytes(self.read::<2>()?))
    }

    /// Read an unsigned byte from the stream.
    pub fn read_u1(&mut self) -> error::Result<u8> {
        Ok(self.read::<1>()?[0])
    }

    /// Utility method to read `S` bytes from the stream.
    pub fn read<const S: usize>(&mut self) -> error::Result<[u8; S]> {
        let mut w = [0; S];
        self.0
            .read_exact(&mut w)
            .map_err(error::ClassFileError::IoError)?;
        self.1 += S;
        Ok(w)
    }

    /// Utility method to read `S` bytes from the stream with runtime length.
    pub fn read_dynamic(&mut self, l: usize) -> error::Result<Vec<u8>> {
        let mut w = vec![0; l];
        self.0
            .read_exact(&mut w)
            .map_err(error::ClassFileError::IoError)?;
        self.1 += l;
        Ok(w)
    }

    /// Skip `len` bytes of stream content, for unknown attributes.
    pub fn skip(&mut self, len: usize) -> error::Result<()> {
        self.read_dynamic(len)?;
        Ok(())
    }
}

/// Decodes a class file's modified UTF-8 (JVMS §4.4.7) byte sequence into a [`String`].
///
/// This differs from both plain UTF-8 and standard CESU-8 only in that the NUL code point is
/// encoded as the two-byte sequence `0xC0 0x80` rather than a single zero byte; supplementary
/// characters use the same surrogate-pair encoding CESU-8 already uses, so the bulk of the
/// decoding is delegated to the `cesu8` crate once the NUL encoding is patched up.
pub fn decode_modified_utf8(bytes: &[u8]) -> error::Result<String> {
    if !bytes.contains(&0) && !bytes.windows(2).any(|w| w == [0xC0, 0x80]) {
        return cesu8::from_cesu8(bytes)
            .map(|c| c.into_owned())
            .map_err(|_| error::ClassFileError::InvalidModifiedUtf8);
    }
    let mut patched = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0 {
            return Err(error::ClassFileError::InvalidModifiedUtf8);
        }
        if bytes[i..].starts_with(&[0xC0, 0x80]) {
            patched.push(0);
            i += 2;
        } else {
            patched.push(bytes[i]);
            i += 1;
        }
    }
    cesu8::from_cesu8(&patched)
        .map(|c| c.into_owned())
        .map_err(|_| error::ClassFileError::InvalidModifiedUtf8)
}

impl ClassFileItem for u8 {
    fn read_from_stream<R: Read>(s: &mut ClassFileStream<R>, _cp: Option<&ConstantPool>) -> error::Result<Self>
    where
        Self: std::marker::Sized {
        s.read_u1()
    }
}

impl ClassFileItem for u16 {
    fn read_from_stream<R: Read>(s: &mut ClassFileStream<R>, _cp: Option<&ConstantPool>) -> error::Result<Self>
    where
        Self: std::marker::Sized {
        s.read_u2()
    }
}

impl ClassFileItem for i16 {
    fn read_from_stream<R: Read>(s: &mut ClassFileStream<R>, _cp: Option<&ConstantPool>) -> error::Result<Self>
    where
        Self: std::marker::Sized {
        Ok(s.read_u2()? as i16)
    }
}

impl ClassFileItem for u32 {
    fn read_from_stream<R: Read>(s: &mut ClassFileStream<R>, _cp: Option<&ConstantPool>) -> error::Result<Self>
    where
        Self: std::marker::Sized {
        s.read_u4()
    }
}

#[cfg(test)]
mod tests {
    use super::decode_modified_utf8;

    #[test]
    fn decodes_plain_ascii() {
        assert_eq!(decode_modified_utf8(b"hello").unwrap(), "hello");
    }

    #[test]
    fn decodes_embedded_nul() {
        let bytes = [b'a', 0xC0, 0x80, b'b'];
        assert_eq!(decode_modified_utf8(&bytes).unwrap(), "a\0b");
    }

    #[test]
    fn rejects_bare_zero_byte() {
        assert!(decode_modified_utf8(&[0]).is_err());
    }
}
