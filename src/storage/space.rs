// src/storage/space.rs

use std::{io, path::Path};

/// 查询缓存目录所在磁盘的可用空间。
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl SpaceProbe for DiskSpaceProbe {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}
