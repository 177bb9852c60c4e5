use sha1::{Digest, Sha1};
use std::path::Path;

/// Identity of a `.torrent` file: what the catalog and admission gate need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrentDescriptor {
    /// Lowercase hex SHA-1 of the raw bencoded `info` dictionary.
    pub info_hash: String,
    pub total_size: u64,
    /// Host of the primary tracker, lowercase. Empty when the torrent has none.
    pub tracker_host: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("undecodable descriptor: {0}")]
    Undecodable(&'static str),
}

pub fn read(path: &Path) -> Result<TorrentDescriptor, DescriptorError> {
    let raw = std::fs::read(path)?;
    decode(&raw)
}

pub fn decode(raw: &[u8]) -> Result<TorrentDescriptor, DescriptorError> {
    let root = BencParser::new(raw)
        .parse_dict()
        .ok_or(DescriptorError::Undecodable("top level is not a dictionary"))?;
    let info_raw = root
        .get_dict_slice(b"info")
        .ok_or(DescriptorError::Undecodable("missing info dictionary"))?;
    let info = BencParser::new(info_raw)
        .parse_dict()
        .ok_or(DescriptorError::Undecodable("info is not a dictionary"))?;

    let total_size = match info.get_int(b"length") {
        Some(len) => u64::try_from(len).map_err(|_| DescriptorError::Undecodable("negative length"))?,
        None => {
            let files = info
                .get_list_dicts(b"files")
                .ok_or(DescriptorError::Undecodable("neither length nor files present"))?;
            let mut total: u64 = 0;
            for file in files {
                let len = file
                    .get_int(b"length")
                    .and_then(|l| u64::try_from(l).ok())
                    .ok_or(DescriptorError::Undecodable("file entry without length"))?;
                total = total.saturating_add(len);
            }
            total
        }
    };

    let announce = root
        .get_bytes(b"announce")
        .or_else(|| root.get_first_nested_bytes(b"announce-list"));
    let tracker_host = announce
        .and_then(|a| std::str::from_utf8(a).ok())
        .and_then(tracker_host)
        .unwrap_or_default();

    Ok(TorrentDescriptor {
        info_hash: hex::encode(Sha1::digest(info_raw)),
        total_size,
        tracker_host,
    })
}

fn tracker_host(announce: &str) -> Option<String> {
    let url = url::Url::parse(announce.trim()).ok()?;
    url.host_str().map(|h| h.to_ascii_lowercase())
}

// ------------------------------
// Minimal bencode “dict-getter”
// ------------------------------

struct BencDict<'a> {
    // Slice containing the dict payload (starts at 'd', ends at matching 'e').
    raw: &'a [u8],
}

impl<'a> BencDict<'a> {
    /// Walks the dict and returns the start offset of the value for `key`.
    fn value_start(&self, key: &[u8]) -> Option<usize> {
        let mut p = BencParser::new(self.raw);
        p.expect_byte(b'd')?;
        loop {
            if p.peek()? == b'e' {
                return None;
            }
            let k = p.parse_bytes()?;
            if k == key {
                return Some(p.pos);
            }
            p.skip_value()?;
        }
    }

    fn get_bytes(&self, key: &[u8]) -> Option<&'a [u8]> {
        let mut p = BencParser::at(self.raw, self.value_start(key)?);
        match p.peek()? {
            b'0'..=b'9' => p.parse_bytes(),
            _ => None,
        }
    }

    fn get_int(&self, key: &[u8]) -> Option<i64> {
        let mut p = BencParser::at(self.raw, self.value_start(key)?);
        p.parse_int()
    }

    fn get_dict_slice(&self, key: &[u8]) -> Option<&'a [u8]> {
        let start = self.value_start(key)?;
        let mut p = BencParser::at(self.raw, start);
        if p.peek()? != b'd' {
            return None;
        }
        p.skip_value()?;
        self.raw.get(start..p.pos)
    }

    fn get_list_dicts(&self, key: &[u8]) -> Option<Vec<BencDict<'a>>> {
        let mut p = BencParser::at(self.raw, self.value_start(key)?);
        p.expect_byte(b'l')?;
        let mut out = Vec::new();
        while p.peek()? != b'e' {
            let start = p.pos;
            if p.peek()? != b'd' {
                return None;
            }
            p.skip_value()?;
            out.push(BencDict {
                raw: self.raw.get(start..p.pos)?,
            });
        }
        Some(out)
    }

    /// First byte string inside a list of lists (`announce-list` tiers).
    fn get_first_nested_bytes(&self, key: &[u8]) -> Option<&'a [u8]> {
        let mut p = BencParser::at(self.raw, self.value_start(key)?);
        p.expect_byte(b'l')?;
        while p.peek()? != b'e' {
            if p.peek()? != b'l' {
                p.skip_value()?;
                continue;
            }
            p.expect_byte(b'l')?;
            while p.peek()? != b'e' {
                if matches!(p.peek()?, b'0'..=b'9') {
                    let url = p.parse_bytes()?;
                    if !url.is_empty() {
                        return Some(url);
                    }
                    continue;
                }
                p.skip_value()?;
            }
            p.expect_byte(b'e')?;
        }
        None
    }
}

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: usize = 64;

struct BencParser<'a> {
    raw: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> BencParser<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0, depth: 0 }
    }

    fn at(raw: &'a [u8], pos: usize) -> Self {
        Self { raw, pos, depth: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.raw.get(self.pos).copied()
    }

    fn expect_byte(&mut self, b: u8) -> Option<()> {
        if self.peek()? != b {
            return None;
        }
        self.pos += 1;
        Some(())
    }

    fn parse_dict(mut self) -> Option<BencDict<'a>> {
        if self.peek()? != b'd' {
            return None;
        }
        let start = self.pos;
        self.skip_value()?;
        let end = self.pos;
        Some(BencDict {
            raw: self.raw.get(start..end)?,
        })
    }

    fn parse_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.parse_usize()?;
        self.expect_byte(b':')?;
        let start = self.pos;
        let end = self.pos.checked_add(len)?;
        let out = self.raw.get(start..end)?;
        self.pos = end;
        Some(out)
    }

    fn parse_int(&mut self) -> Option<i64> {
        self.expect_byte(b'i')?;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(self.raw.get(start..self.pos)?).ok()?;
        self.pos += 1;
        digits.parse().ok()
    }

    fn parse_usize(&mut self) -> Option<usize> {
        let mut n: usize = 0;
        let mut saw = false;
        while let Some(b) = self.peek() {
            if !b.is_ascii_digit() {
                break;
            }
            saw = true;
            n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
            self.pos += 1;
        }
        if !saw { None } else { Some(n) }
    }

    fn skip_value(&mut self) -> Option<()> {
        match self.peek()? {
            b'i' => self.parse_int().map(|_| ()),
            open @ (b'l' | b'd') => {
                if self.depth >= MAX_DEPTH {
                    return None;
                }
                self.depth += 1;
                self.pos += 1;
                while self.peek()? != b'e' {
                    if open == b'd' {
                        self.parse_bytes()?;
                    }
                    self.skip_value()?;
                }
                self.pos += 1;
                self.depth -= 1;
                Some(())
            }
            b'0'..=b'9' => self.parse_bytes().map(|_| ()),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    fn benc_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(bytes.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(bytes);
    }

    /// Single-file torrent. `name` makes the info hash unique per fixture.
    pub(crate) fn single_file(name: &str, length: u64, announce: &str) -> Vec<u8> {
        let mut out = b"d".to_vec();
        if !announce.is_empty() {
            benc_bytes(&mut out, b"announce");
            benc_bytes(&mut out, announce.as_bytes());
        }
        benc_bytes(&mut out, b"info");
        out.push(b'd');
        benc_bytes(&mut out, b"length");
        out.extend_from_slice(format!("i{length}e").as_bytes());
        benc_bytes(&mut out, b"name");
        benc_bytes(&mut out, name.as_bytes());
        benc_bytes(&mut out, b"piece length");
        out.extend_from_slice(b"i16384e");
        benc_bytes(&mut out, b"pieces");
        benc_bytes(&mut out, &[0u8; 20]);
        out.extend_from_slice(b"ee");
        out
    }

    pub(crate) fn info_slice(raw: &[u8]) -> &[u8] {
        // Fixtures always end the root dict right after the info dict.
        let key = b"4:info";
        let pos = raw
            .windows(key.len())
            .position(|w| w == key)
            .unwrap_or_default();
        &raw[pos + key.len()..raw.len() - 1]
    }
}
