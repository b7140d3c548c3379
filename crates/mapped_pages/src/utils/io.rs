use std::{fs::File, io};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(windows)]
use std::os::windows::fs::FileExt;

#[cfg(not(any(unix, windows)))]
compile_error!("mapped_pages is not supported on this platform");

const ZEROS_CHUNK_SIZE: usize = 64 * 1024;
static ZEROS: [u8; ZEROS_CHUNK_SIZE] = [0; ZEROS_CHUNK_SIZE];

/// Writes `len` zero bytes at `offset`, growing the file if the range ends
/// past its current length.
///
/// The zeros are written densely, chunk by chunk, so the range never ends up
/// as a sparse hole in the file.
pub(crate) fn write_zeros_at(file: &File, offset: u64, len: u64) -> io::Result<()> {
	let mut written: u64 = 0;
	while written < len {
		let chunk_len = usize::try_from(len - written)
			.unwrap_or(usize::MAX)
			.min(ZEROS_CHUNK_SIZE);
		write_all_at(file, &ZEROS[..chunk_len], offset + written)?;
		written += chunk_len as u64;
	}
	Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
	FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
	while !buf.is_empty() {
		match FileExt::seek_write(file, buf, offset) {
			Ok(0) => {
				return Err(io::Error::new(
					io::ErrorKind::WriteZero,
					"failed to write whole buffer",
				))
			}
			Ok(n) => {
				buf = &buf[n..];
				offset += n as u64;
			}
			Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
			Err(err) => return Err(err),
		}
	}
	Ok(())
}
