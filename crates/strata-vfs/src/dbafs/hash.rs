//! Content fingerprints.
//!
//! Files hash their content, directories hash their children's names and
//! hashes, so an unchanged subtree keeps its hash wherever it lives.

use std::io;

use tokio::io::AsyncReadExt;

use crate::types::ByteStream;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex BLAKE3 hash of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Hex BLAKE3 hash of everything a stream yields, read in chunks.
pub async fn hash_stream(mut stream: ByteStream) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash of a directory from its direct children's `(name, hash)` pairs.
///
/// Order of the input does not matter.
pub fn hash_directory<'a>(children: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut children: Vec<_> = children.into_iter().collect();
    children.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for (name, hash) in children {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_stream_hash_matches_slice_hash() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 17];
        let stream: ByteStream = Box::new(Cursor::new(data.clone()));
        assert_eq!(hash_stream(stream).await.unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_directory_hash_is_order_independent() {
        let a = hash_directory([("a.txt", "1"), ("b.txt", "2")]);
        let b = hash_directory([("b.txt", "2"), ("a.txt", "1")]);
        assert_eq!(a, b);

        let renamed = hash_directory([("a.txt", "1"), ("c.txt", "2")]);
        assert_ne!(a, renamed);
    }

    #[test]
    fn test_empty_directory_hash_is_stable() {
        let empty: [(&str, &str); 0] = [];
        assert_eq!(hash_directory(empty), hash_directory(Vec::new()));
    }
}
