use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

trait WriteWithOffset {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), std::io::Error>;
}

impl WriteWithOffset for File {
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<(), std::io::Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}

trait ReadWithOffset {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), std::io::Error>;
}

impl ReadWithOffset for File {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), std::io::Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Creates the backing file sized to the full torrent length, along with any
/// missing parent directories.
pub fn allocate_file(path: &Path, total_length: u64) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.set_len(total_length)?;
    Ok(())
}

/// Writes a verified piece to the backing file at the given offset.
pub fn save_piece(path: &Path, piece: &[u8], piece_offset: u64) -> Result<(), std::io::Error> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    file.write_all_at(piece, piece_offset)?;

    Ok(())
}

/// Retrieves a block of data from the backing file at a given offset.
pub fn retrieve_block(path: &Path, offset: u64, length: usize) -> Result<Vec<u8>, std::io::Error> {
    let mut file = OpenOptions::new().read(true).open(path)?;

    let mut buffer = vec![0; length];
    file.read_exact_at(&mut buffer, offset)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_allocate_creates_file_of_the_right_size() {
        let path = create_test_path("test_disk_allocate");

        allocate_file(&path, 1000).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 1000);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_save_and_retrieve_round_trip() {
        let path = create_test_path("test_disk_round_trip");
        allocate_file(&path, 100).unwrap();

        let contents = b"Hello, world!";
        save_piece(&path, contents, 40).unwrap();

        let block = retrieve_block(&path, 44, 7).unwrap();

        assert_eq!(&block[..], b"o, worl");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_save_between_existing_pieces() {
        let path = create_test_path("test_disk_save_between");
        allocate_file(&path, 10).unwrap();

        save_piece(&path, &[1, 2, 3, 4], 0).unwrap();
        save_piece(&path, &[8, 9, 10], 7).unwrap();
        save_piece(&path, &[5, 6, 7], 4).unwrap();

        let contents = fs::read(&path).unwrap();
        assert_eq!(contents, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_retrieve_past_the_end_fails() {
        let path = create_test_path("test_disk_past_end");
        allocate_file(&path, 10).unwrap();

        let io_error = retrieve_block(&path, 5, 6).unwrap_err();

        assert_eq!(io_error.kind(), std::io::ErrorKind::UnexpectedEof);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_retrieve_from_missing_file_fails() {
        let path = create_test_path("test_disk_missing_file");

        let io_error = retrieve_block(&path, 0, 5).unwrap_err();

        assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
    }

    // Auxiliary functions

    fn create_test_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("storrent_{}", name))
    }
}
