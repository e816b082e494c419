// src/storage/signature.rs

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

const SNIFF_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSignature {
    Jpeg,
    Png,
    Webp,
    Mp4,
}

pub fn detect(header: &[u8]) -> Option<MediaSignature> {
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(MediaSignature::Jpeg);
    }
    if header.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(MediaSignature::Png);
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return Some(MediaSignature::Webp);
    }
    // ISO BMFF: 第一个 box 的类型位于偏移 4
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return Some(MediaSignature::Mp4);
    }
    None
}

/// 读取文件开头的字节并识别媒体类型。
pub fn sniff_file(path: &Path) -> io::Result<Option<MediaSignature>> {
    let mut file = File::open(path)?;
    let mut header = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(detect(&header[..filled]))
}
