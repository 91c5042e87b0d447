#![deny(missing_docs)]

//! A module that provides utility functions for computing content digests
//! using the [RustCrypto/hashes](https://github.com/RustCrypto/hashes)
//! library.
//!
//! The repository engine identifies stored content by its SHA-1 digest, so
//! everything here defaults to [`Sha1`], but by utilizing the [`Digest`]
//! trait any hashing algorithm that implements that trait can be used with
//! the functions provided in this crate.
//!
//! # Available functions
//!
//! - [`compute_bytes_digest`]: Computes the hash of a slice of bytes.
//! - [`compute_file_digest`]: Computes the hash of a file on disk.
//! - [`compute_file_range_digest`]: Computes the hash of a byte range of an
//!   already open file.
//! - [`parse_digest_from_hex`]: Given a hex representation of a digest,
//!   parses it to bytes.
//! - [`HashingReader`] / [`HashingWriter`]: adapters that hash everything
//!   passing through an `impl Read` / `impl Write`.

pub use digest;

use digest::{Digest, Output};
use std::io::{Read, Seek, SeekFrom, Write};
use std::{fs::File, path::Path};

pub use sha1::Sha1;

/// A type alias for the output of a SHA1 hash.
pub type Sha1Hash = sha1::digest::Output<Sha1>;

/// Compute a hash of the file at the specified location.
pub fn compute_file_digest<D: Digest + Default + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    // Open the file for reading
    let mut file = File::open(path)?;

    // Determine the hash of the file on disk
    let mut hasher = D::default();
    std::io::copy(&mut file, &mut hasher)?;

    Ok(hasher.finalize())
}

/// Compute a hash over a byte range of an already open file.
///
/// The file's cursor is repositioned to `offset` before reading; exactly
/// `len` bytes are consumed. Reaching end-of-file before `len` bytes have
/// been hashed is an [`std::io::ErrorKind::UnexpectedEof`] error.
pub fn compute_file_range_digest<D: Digest + Default + Write>(
    file: &mut File,
    offset: u64,
    len: u64,
) -> Result<Output<D>, std::io::Error> {
    file.seek(SeekFrom::Start(offset))?;

    let mut hasher = D::default();
    let copied = std::io::copy(&mut file.take(len), &mut hasher)?;
    if copied != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes but the file ended after {copied}"),
        ));
    }

    Ok(hasher.finalize())
}

/// Compute a hash of the specified bytes.
pub fn compute_bytes_digest<D: Digest + Default + Write>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hash hex string to a digest.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    match hex::decode_to_slice(str, &mut hash) {
        Ok(_) => Some(hash),
        Err(_) => None,
    }
}

/// A simple object that provides a [`Write`] implementation that also
/// immediately hashes the bytes written to it. Call
/// [`HashingWriter::finalize`] to retrieve both the original `impl Write`
/// object as well as the hash.
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

impl<W, D: Digest + Default> HashingWriter<W, D> {
    /// Constructs a new instance from a writer and a new (empty) hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Default::default(),
        }
    }
}

impl<W, D: Digest> HashingWriter<W, D> {
    /// Consumes this instance and returns the original writer and the hash of
    /// all bytes written to this instance.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A simple object that provides a [`Read`] implementation that also
/// immediately hashes the bytes read from it. Call
/// [`HashingReader::finalize`] to retrieve both the original `impl Read`
/// object as well as the hash.
pub struct HashingReader<R, D: Digest> {
    reader: R,
    hasher: D,
}

impl<R, D: Digest + Default> HashingReader<R, D> {
    /// Constructs a new instance from a reader and a new (empty) hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Default::default(),
        }
    }
}

impl<R, D: Digest> HashingReader<R, D> {
    /// Consumes this instance and returns the original reader and the hash of
    /// all bytes read from this instance.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.reader, self.hasher.finalize())
    }
}

impl<R: Read, D: Digest> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}

#[cfg(test)]
mod test {
    use super::{HashingReader, Sha1};
    use rstest::rstest;
    use std::io::Read;

    #[rstest]
    #[case("1234567890", "01b307acba4f54f55aafc33bb06bbbf6ca803e9a")]
    #[case("Hello, world!", "943a702d06f34599aee1f8da8ef9f7296031d699")]
    fn test_compute_file_sha1(#[case] input: &str, #[case] expected_hash: &str) {
        // Write a known value to a temporary file and verify that the computed
        // hash matches what we would expect.

        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test");
        std::fs::write(&file_path, input).unwrap();
        let hash = super::compute_file_digest::<Sha1>(&file_path).unwrap();

        assert_eq!(format!("{hash:x}"), expected_hash);
    }

    #[rstest]
    #[case("1234567890", "01b307acba4f54f55aafc33bb06bbbf6ca803e9a")]
    #[case("Hello, world!", "943a702d06f34599aee1f8da8ef9f7296031d699")]
    fn test_hashing_reader_sha1(#[case] input: &str, #[case] expected_hash: &str) {
        let mut cursor = HashingReader::<_, Sha1>::new(std::io::Cursor::new(input));
        let mut cursor_string = String::new();
        cursor.read_to_string(&mut cursor_string).unwrap();
        assert_eq!(&cursor_string, input);
        let (_, hash) = cursor.finalize();
        assert_eq!(format!("{hash:x}"), expected_hash);
    }

    #[test]
    fn test_file_range_digest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test");
        std::fs::write(&file_path, "xxHello, world!xx").unwrap();

        let mut file = std::fs::File::open(&file_path).unwrap();
        let hash = super::compute_file_range_digest::<Sha1>(&mut file, 2, 13).unwrap();
        assert_eq!(
            format!("{hash:x}"),
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        );

        // Asking for more bytes than the file holds is an error, not a short
        // digest.
        let err = super::compute_file_range_digest::<Sha1>(&mut file, 2, 100).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
