//! # File Transfer Payloads
//!
//! Helpers for consumers that send and receive `file_transfer` messages.
//! The node itself never touches files; it forwards the message untouched.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::messages::Message;

/// Field names, quotes, and the size digits around a `file_transfer` payload.
const ENVELOPE_BYTES: usize = 128;

/// Upper bound on the encoded frame carrying `filesize` bytes of content.
///
/// Text fields are counted at six bytes per byte, the worst case for JSON
/// escaping; base64 output is never escaped.
pub fn frame_size_bound(sender: &str, recipient: &str, filename: &str, filesize: u64) -> u64 {
    let text = (sender.len() + recipient.len() + filename.len()) as u64 * 6;
    filesize.div_ceil(3) * 4 + text + ENVELOPE_BYTES as u64
}

/// Read `path` and wrap it in a `file_transfer` message.
///
/// Fails without reading the file if the resulting frame could exceed
/// `max_frame_bytes`, since a peer drops the connection on such a frame.
/// Reading and encoding run on the blocking pool.
pub async fn file_message(
    sender: &str,
    recipient: &str,
    path: &Path,
    max_frame_bytes: usize,
) -> Result<Message> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
        .to_string();

    let check_size = |filesize: u64| -> Result<()> {
        let bound = frame_size_bound(sender, recipient, &filename, filesize);
        if bound > max_frame_bytes as u64 {
            bail!(
                "{} is {} bytes; encoded it would exceed the {} byte frame limit",
                path.display(),
                filesize,
                max_frame_bytes
            );
        }
        Ok(())
    };

    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    check_size(metadata.len())?;

    let source = path.to_path_buf();
    let (filesize, content) = tokio::task::spawn_blocking(move || -> Result<(u64, String)> {
        let data = fs::read(&source).with_context(|| format!("reading {}", source.display()))?;
        Ok((data.len() as u64, general_purpose::STANDARD.encode(&data)))
    })
    .await
    .map_err(|e| anyhow!("File read task panicked: {}", e))??;

    // The file may have grown since it was measured.
    check_size(filesize)?;

    Ok(Message::FileTransfer {
        sender: sender.to_string(),
        recipient: recipient.to_string(),
        filename,
        filesize,
        content,
    })
}

/// Decode a received `file_transfer` message into `dir`.
///
/// Only the final component of the sender's file name is used, so a payload
/// can never be written outside `dir`. Returns the written path.
pub fn save_file(dir: &Path, message: &Message) -> Result<PathBuf> {
    let Message::FileTransfer {
        sender,
        filename,
        filesize,
        content,
        ..
    } = message
    else {
        bail!("expected file_transfer, got {}", message.kind());
    };

    let name = Path::new(filename)
        .file_name()
        .ok_or_else(|| anyhow!("{} sent an invalid file name {:?}", sender, filename))?;

    let data = general_purpose::STANDARD
        .decode(content)
        .with_context(|| format!("decoding {} from {}", filename, sender))?;
    if data.len() as u64 != *filesize {
        bail!(
            "{} from {} is {} bytes, expected {}",
            filename,
            sender,
            data.len(),
            filesize
        );
    }

    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let target = dir.join(name);
    fs::write(&target, &data).with_context(|| format!("writing {}", target.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 16 * 1024 * 1024;

    #[tokio::test]
    async fn test_file_survives_send_and_save() {
        let source_dir = tempfile::tempdir().unwrap();
        let download_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("report.bin");
        let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        fs::write(&source, &bytes).unwrap();

        let message = file_message("alice", "bob", &source, LIMIT).await.unwrap();
        match &message {
            Message::FileTransfer { filename, filesize, .. } => {
                assert_eq!(filename, "report.bin");
                assert_eq!(*filesize, 1000);
            }
            other => panic!("unexpected {:?}", other),
        }

        let saved = save_file(download_dir.path(), &message).unwrap();
        assert_eq!(saved, download_dir.path().join("report.bin"));
        assert_eq!(fs::read(saved).unwrap(), bytes);
    }

    #[test]
    fn test_save_strips_directories_from_filename() {
        let download_dir = tempfile::tempdir().unwrap();
        let message = Message::FileTransfer {
            sender: "mallory".into(),
            recipient: "bob".into(),
            filename: "../../etc/passwd".into(),
            filesize: 2,
            content: general_purpose::STANDARD.encode(b"hi"),
        };

        let saved = save_file(download_dir.path(), &message).unwrap();
        assert_eq!(saved, download_dir.path().join("passwd"));
    }

    #[test]
    fn test_save_rejects_size_mismatch_and_bad_base64() {
        let download_dir = tempfile::tempdir().unwrap();
        let mut message = Message::FileTransfer {
            sender: "alice".into(),
            recipient: "bob".into(),
            filename: "a.txt".into(),
            filesize: 10,
            content: general_purpose::STANDARD.encode(b"short"),
        };
        assert!(save_file(download_dir.path(), &message).is_err());

        if let Message::FileTransfer { content, .. } = &mut message {
            *content = "***".into();
        }
        assert!(save_file(download_dir.path(), &message).is_err());
        assert!(save_file(download_dir.path(), &Message::presence("a", "b")).is_err());
    }

    #[tokio::test]
    async fn test_file_too_large_for_a_frame_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.bin");
        fs::write(&source, vec![7u8; 3000]).unwrap();

        // 3000 bytes become 4000 base64 characters.
        let err = file_message("alice", "bob", &source, 4000).await.unwrap_err();
        assert!(err.to_string().contains("frame limit"), "{:#}", err);

        let message = file_message("alice", "bob", &source, 8000).await.unwrap();
        let frame = crate::common::connection::encode_frame(&message).unwrap();
        assert!(
            frame.len() as u64 <= frame_size_bound("alice", "bob", "big.bin", 3000),
            "bound too small for a {} byte frame",
            frame.len()
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        assert!(file_message("alice", "bob", &missing, LIMIT).await.is_err());
    }
}
