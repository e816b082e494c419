// src/storage/naming.rs

use crate::utils;
use percent_encoding::percent_decode_str;

/// 规范化 URL：去除首尾空白，反斜杠转正斜杠，去掉末尾的斜杠。
pub fn normalize_url(url: &str) -> String {
    url.trim().replace('\\', "/").trim_end_matches('/').to_string()
}

/// 缓存文件名：`{md5(规范化URL)}_{可读文件名}`。
pub fn cache_file_name(url: &str) -> String {
    let normalized = normalize_url(url);
    format!(
        "{}_{}",
        utils::md5_hex(normalized.as_bytes()),
        readable_name(&normalized)
    )
}

/// 缓存文件名中哈希之后的部分，由 URL 路径的最后一段得到。
pub fn readable_name(url: &str) -> String {
    let normalized = normalize_url(url);
    let path_part = normalized.split(['?', '#']).next().unwrap_or_default();
    let tail = path_part.rsplit('/').next().unwrap_or_default();
    let decoded = percent_decode_str(tail).decode_utf8_lossy();

    match split_extension(&decoded) {
        (stem, Some(ext)) => format!("{}.{}", utils::sanitize_filename(stem), ext),
        (stem, None) => utils::sanitize_filename(stem),
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=8).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}
