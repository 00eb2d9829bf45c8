use std::path::PathBuf;

use crate::{
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};
use serde_bencode::Error;
use sha1::{Digest, Sha1};

/// The bencoded fields as they appear in a `.torrent` file.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: Info,
}

/// A torrent's metainfo.
///
/// This normalizes the raw bencoded fields into the shape the rest of the
/// engine wants: file layout and piece length are derived once here, rather
/// than every caller re-deriving them from `info`.
#[derive(Debug)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub name: String,
    pub piece_len: u32,
    pub structure: FsStructure,
    info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawMetainfo) -> Self {
        let name = raw.info.name.clone();
        let piece_len = raw.info.piece_length as u32;

        let structure = match &raw.info.files {
            Some(files) => {
                let mut torrent_offset = 0u64;
                let files = files
                    .iter()
                    .map(|file| {
                        let info = FileInfo {
                            path: file.path.iter().collect(),
                            len: file.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += info.len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&name),
                len: raw.info.length.unwrap_or(0),
                torrent_offset: 0,
            }),
        };

        Self {
            announce: raw.announce,
            announce_list: raw.announce_list,
            name,
            piece_len,
            structure,
            info: raw.info,
        }
    }

    /// The number of pieces in torrent, derived from the length of the
    /// concatenated piece hashes.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn create_info_hash(&self) -> Result<Sha1Hash, Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The raw, 20-byte-per-piece SHA-1 hash blob as it appeared in the
    /// torrent file.
    pub fn piece_hashes(&self) -> &[u8] {
        &self.info.pieces
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Info {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<File>>,
    #[allow(dead_code)]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct File {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce9:udp://tr4:infod6:lengthi20e4:name3:foo12:piece lengthi10e6:pieces40:");
        buf.extend_from_slice(&[0u8; 40]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent_into_file_structure() {
        let metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        assert_eq!(metainfo.name, "foo");
        assert_eq!(metainfo.piece_len, 10);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 20);
    }

    #[test]
    fn exposes_announce_url() {
        let metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        assert_eq!(metainfo.announce, "udp://tr");
        assert_eq!(metainfo.announce_list, None);
    }
}
