// src/storage/mod.rs

pub mod naming;
pub mod signature;
mod space;

pub use space::{DiskSpaceProbe, SpaceProbe};

use crate::{constants, error::AppResult};
use log::{debug, info, warn};
use std::{
    collections::HashSet,
    fs::{self, FileTimes},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone)]
pub struct CacheLimits {
    pub max_cache_bytes: u64,
    pub min_free_bytes: u64,
    pub max_age: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_cache_bytes: constants::cache::MAX_CACHE_BYTES,
            min_free_bytes: constants::cache::MIN_FREE_BYTES,
            max_age: constants::cache::MAX_AGE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_count: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub cache_dir: PathBuf,
}

impl CacheStats {
    pub fn usage_percentage(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        (self.total_bytes as f64 / self.max_bytes as f64) * 100.0
    }
}

#[derive(Debug)]
struct CachedFile {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
    modified: SystemTime,
}

impl CachedFile {
    fn is_expired(&self, now: SystemTime, max_age: Duration) -> bool {
        let older_than = |t: SystemTime| now.duration_since(t).is_ok_and(|age| age > max_age);
        older_than(self.modified) || older_than(self.accessed)
    }
}

/// 本地媒体缓存：一个扁平目录，文件按 URL 内容寻址。
///
/// 删除、空间检查和校验共用同一把锁，避免在校验过程中删掉文件。
/// 下载先写入 `.part` 临时文件，校验通过后才改名为正式的缓存文件。
///
/// 当前播放列表的文件受保护：按空间或年龄清理时不会删除它们，只有
/// [`StorageCache::retain_only`] 和 [`StorageCache::clear_all`] 会。
pub struct StorageCache {
    dir: PathBuf,
    limits: CacheLimits,
    space: Arc<dyn SpaceProbe>,
    lock: Mutex<()>,
    protected: Mutex<HashSet<String>>,
}

impl StorageCache {
    pub fn new(dir: impl Into<PathBuf>, limits: CacheLimits) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let dir = dunce::canonicalize(&dir)?;
        info!("缓存目录: \"{}\"", dir.display());
        Ok(Self {
            dir,
            limits,
            space: Arc::new(DiskSpaceProbe),
            lock: Mutex::new(()),
            protected: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    pub fn cache_file_for(&self, url: &str) -> PathBuf {
        self.dir.join(naming::cache_file_name(url))
    }

    /// 文件存在、非空，且开头字节是已知的媒体格式。
    pub fn is_valid(&self, path: &Path) -> bool {
        let _guard = self.lock();
        Self::validate(path)
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.is_valid(&self.cache_file_for(url))
    }

    /// 把文件的访问和修改时间刷新为当前时间，使其在淘汰顺序中排到最后。
    pub fn touch(&self, path: &Path) {
        let now = SystemTime::now();
        let result = fs::File::options()
            .write(true)
            .open(path)
            .and_then(|f| f.set_times(FileTimes::new().set_accessed(now).set_modified(now)));
        if let Err(e) = result {
            debug!("刷新缓存文件时间失败 {:?}: {}", path.file_name(), e);
        }
    }

    /// 用 `urls` 替换受保护的文件集合。
    pub fn protect<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: HashSet<String> = urls
            .into_iter()
            .map(|u| naming::cache_file_name(u.as_ref()))
            .collect();
        debug!("受保护的缓存文件: {} 个", names.len());
        *self.lock_protected() = names;
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        let protected = self.lock_protected();
        file_name_of(path).is_some_and(|name| protected.contains(&name))
    }

    fn validate(path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => {
                debug!("缓存文件为空或不是普通文件: {:?}", path);
                return false;
            }
            Err(_) => return false,
        }
        match signature::sniff_file(path) {
            Ok(Some(kind)) => {
                debug!("缓存文件 {:?} 识别为 {:?}", path.file_name(), kind);
                true
            }
            Ok(None) => {
                debug!("缓存文件 {:?} 不是可识别的媒体格式", path.file_name());
                false
            }
            Err(e) => {
                warn!("读取缓存文件 {:?} 失败: {}", path, e);
                false
            }
        }
    }

    pub fn total_size(&self) -> u64 {
        self.list_files().iter().map(|f| f.size).sum()
    }

    pub fn stats(&self) -> CacheStats {
        let files = self.list_files();
        CacheStats {
            file_count: files.len(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            max_bytes: self.limits.max_cache_bytes,
            cache_dir: self.dir.clone(),
        }
    }

    /// 确保还能写入 `required` 字节。必要时先清理，再按最近使用时间从旧到新逐个删除，
    /// 一旦空间足够立即停止。
    pub fn ensure_space(&self, required: u64) -> bool {
        let _guard = self.lock();
        if required > self.limits.max_cache_bytes {
            warn!(
                "请求的空间 {} 字节超过缓存上限 {} 字节",
                required, self.limits.max_cache_bytes
            );
            return false;
        }

        let mut files = self.list_files();
        let mut used: u64 = files.iter().map(|f| f.size).sum();
        if self.fits(required, used) {
            return true;
        }

        info!("缓存空间不足 (已用 {} 字节，需要 {} 字节)，开始清理", used, required);
        let report = self.cleanup_locked(false);
        if report.deleted_count > 0 {
            files = self.list_files();
            used = files.iter().map(|f| f.size).sum();
            if self.fits(required, used) {
                return true;
            }
        }

        sort_oldest_first(&mut files);
        for file in files {
            if self.fits(required, used) {
                return true;
            }
            if !self.is_evictable(&file.path) {
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    used = used.saturating_sub(file.size);
                    info!("为腾出空间删除缓存文件: {:?} ({} 字节)", file.path.file_name(), file.size);
                }
                Err(e) => warn!("删除缓存文件 {:?} 失败: {}", file.path, e),
            }
        }

        let fits = self.fits(required, used);
        if !fits {
            warn!("删除所有可删除的缓存文件后空间仍然不足 (需要 {} 字节)", required);
        }
        fits
    }

    /// 在空间紧张时把用量降到上限的 70%，并保证最小可用空间；
    /// 超过最大保留时间的文件无论是否紧张都会被删除。
    pub fn cleanup(&self, force: bool) -> CleanupReport {
        let _guard = self.lock();
        self.cleanup_locked(force)
    }

    fn cleanup_locked(&self, force: bool) -> CleanupReport {
        let mut files = self.list_files();
        sort_oldest_first(&mut files);
        let mut used: u64 = files.iter().map(|f| f.size).sum();

        let max = self.limits.max_cache_bytes as f64;
        let over_trigger = used as f64 > max * constants::cache::CLEANUP_TRIGGER_RATIO;
        let under_pressure = force || over_trigger || self.low_on_free_space();
        let target = (max * constants::cache::CLEANUP_TARGET_RATIO) as u64;
        let now = SystemTime::now();

        if under_pressure {
            debug!(
                "触发缓存清理 (force={}, 已用 {} 字节, 目标 {} 字节)",
                force, used, target
            );
        }

        let mut report = CleanupReport::default();
        for file in files {
            if !self.is_evictable(&file.path) {
                continue;
            }
            let expired = file.is_expired(now, self.limits.max_age);
            let pressing = under_pressure && (used > target || self.low_on_free_space());
            if !expired && !pressing {
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    used = used.saturating_sub(file.size);
                    report.deleted_count += 1;
                    report.freed_bytes += file.size;
                    debug!(
                        "清理缓存文件 {:?} (过期: {})",
                        file.path.file_name(),
                        expired
                    );
                }
                Err(e) => warn!("删除缓存文件 {:?} 失败: {}", file.path, e),
            }
        }

        if report.deleted_count > 0 {
            info!(
                "缓存清理完成: 删除 {} 个文件，释放 {} 字节",
                report.deleted_count, report.freed_bytes
            );
        }
        report
    }

    /// 只保留 `urls_to_keep` 对应的缓存文件，其余全部删除。
    pub fn retain_only<I, S>(&self, urls_to_keep: I) -> CleanupReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep: HashSet<String> = urls_to_keep
            .into_iter()
            .map(|u| naming::cache_file_name(u.as_ref()))
            .collect();

        let _guard = self.lock();
        let mut report = CleanupReport::default();
        for file in self.list_files() {
            let name = file_name_of(&file.path).unwrap_or_default();
            if keep.contains(&name) {
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    report.deleted_count += 1;
                    report.freed_bytes += file.size;
                    debug!("删除不在播放列表中的缓存文件: {}", name);
                }
                Err(e) => warn!("删除缓存文件 {:?} 失败: {}", file.path, e),
            }
        }
        if report.deleted_count > 0 {
            info!(
                "已移除 {} 个过时的缓存文件，释放 {} 字节",
                report.deleted_count, report.freed_bytes
            );
        }
        *self.lock_protected() = keep;
        report
    }

    pub fn clear_all(&self) -> usize {
        let _guard = self.lock();
        self.lock_protected().clear();
        let mut deleted = 0;
        for file in self.list_files() {
            match fs::remove_file(&file.path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("删除缓存文件 {:?} 失败: {}", file.path, e),
            }
        }
        if deleted > 0 {
            info!("已清空缓存目录，删除 {} 个文件", deleted);
        }
        deleted
    }

    pub fn remove(&self, path: &Path) {
        let _guard = self.lock();
        match fs::remove_file(path) {
            Ok(()) => debug!("已删除缓存文件: {:?}", path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("删除缓存文件 {:?} 失败: {}", path, e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_protected(&self) -> MutexGuard<'_, HashSet<String>> {
        self.protected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 受保护的文件和下载中的临时文件都不参与淘汰。
    fn is_evictable(&self, path: &Path) -> bool {
        let Some(name) = file_name_of(path) else {
            return false;
        };
        !name.ends_with(constants::cache::PART_SUFFIX) && !self.lock_protected().contains(&name)
    }

    fn available_space(&self) -> Option<u64> {
        match self.space.available_bytes(&self.dir) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("无法获取磁盘可用空间: {}", e);
                None
            }
        }
    }

    fn low_on_free_space(&self) -> bool {
        self.available_space()
            .is_some_and(|free| free < self.limits.min_free_bytes)
    }

    fn fits(&self, required: u64, used: u64) -> bool {
        if used.saturating_add(required) > self.limits.max_cache_bytes {
            return false;
        }
        match self.available_space() {
            Some(free) => free.saturating_sub(required) >= self.limits.min_free_bytes,
            None => true,
        }
    }

    fn list_files(&self) -> Vec<CachedFile> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取缓存目录 {:?} 失败: {}", self.dir, e);
                return Vec::new();
            }
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let modified = meta.modified().unwrap_or(UNIX_EPOCH);
                Some(CachedFile {
                    path: entry.path(),
                    size: meta.len(),
                    accessed: meta.accessed().unwrap_or(modified),
                    modified,
                })
            })
            .collect()
    }
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn sort_oldest_first(files: &mut [CachedFile]) {
    files.sort_by_key(|f| (f.accessed, f.modified));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use std::io::Write;
    use tempfile::TempDir;

    const MP4_HEADER: &[u8] = b"\x00\x00\x00\x18ftypisom";

    struct FixedSpace(u64);

    impl SpaceProbe for FixedSpace {
        fn available_bytes(&self, _dir: &Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    fn new_cache(max_cache_bytes: u64) -> (StorageCache, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_cache_bytes,
            min_free_bytes: 0,
            max_age: constants::cache::MAX_AGE,
        };
        let cache = StorageCache::new(dir.path(), limits)
            .unwrap()
            .with_space_probe(Arc::new(FixedSpace(u64::MAX)));
        (cache, dir)
    }

    /// 写入一个指定大小的 MP4 文件，并把访问/修改时间设为 `age` 之前。
    fn write_media(path: &Path, size: usize, age: Duration) {
        let mut data = MP4_HEADER.to_vec();
        data.resize(size.max(MP4_HEADER.len()), 0);
        let mut file = File::create(path).unwrap();
        file.write_all(&data).unwrap();
        let when = SystemTime::now() - age;
        file.set_times(FileTimes::new().set_accessed(when).set_modified(when))
            .unwrap();
    }

    fn hours(n: u64) -> Duration {
        Duration::from_secs(n * 3600)
    }

    #[test]
    fn test_is_valid_requires_known_signature() {
        let (cache, _dir) = new_cache(1_000_000);
        let path = cache.cache_file_for("http://h/a.mp4");
        assert!(!cache.is_valid(&path), "不存在的文件不应有效");

        File::create(&path).unwrap();
        assert!(!cache.is_valid(&path), "空文件不应有效");

        fs::write(&path, b"<html>oops</html>").unwrap();
        assert!(!cache.is_valid(&path), "错误页面不应有效");

        write_media(&path, 64, Duration::ZERO);
        assert!(cache.is_valid(&path));
        assert!(cache.is_cached("http://h/a.mp4"));
    }

    #[test]
    fn test_retain_only_removes_exactly_the_stale_file() {
        let (cache, _dir) = new_cache(1_000_000);
        let urls = ["http://h/a.mp4", "http://h/b.mp4", "http://h/c.mp4"];
        for (i, url) in urls.iter().enumerate() {
            write_media(&cache.cache_file_for(url), 100, hours(3 - i as u64));
        }
        let mtime = |url: &str| fs::metadata(cache.cache_file_for(url)).unwrap().modified().unwrap();
        let a_before = mtime(urls[0]);
        let b_before = mtime(urls[1]);

        let report = cache.retain_only([urls[0], urls[1]]);

        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.freed_bytes, 100);
        assert!(!cache.cache_file_for(urls[2]).exists());
        assert_eq!(mtime(urls[0]), a_before);
        assert_eq!(mtime(urls[1]), b_before);
    }

    #[test]
    fn test_ensure_space_evicts_oldest_first_and_no_more() {
        let (cache, _dir) = new_cache(1000);
        let oldest = cache.cache_file_for("http://h/oldest.mp4");
        let middle = cache.cache_file_for("http://h/middle.mp4");
        let newest = cache.cache_file_for("http://h/newest.mp4");
        write_media(&oldest, 100, hours(3));
        write_media(&middle, 100, hours(2));
        write_media(&newest, 100, hours(1));

        // 已用 300，需要 800：删掉最旧的一个正好够用
        assert!(cache.ensure_space(800));
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());

        // 需要 900：还得再删一个，仍然从最旧的开始
        assert!(cache.ensure_space(900));
        assert!(!middle.exists());
        assert!(newest.exists());
    }

    #[test]
    fn test_ensure_space_never_evicts_protected_files() {
        let (cache, _dir) = new_cache(1000);
        let oldest = cache.cache_file_for("http://h/oldest.mp4");
        let middle = cache.cache_file_for("http://h/middle.mp4");
        let newest = cache.cache_file_for("http://h/newest.mp4");
        write_media(&oldest, 100, hours(3));
        write_media(&middle, 100, hours(2));
        write_media(&newest, 100, hours(1));
        cache.protect(["http://h/oldest.mp4", "http://h/missing.mp4"]);

        assert!(cache.ensure_space(800));
        assert!(oldest.exists(), "当前播放列表中的文件不应被淘汰");
        assert!(!middle.exists());
        assert!(newest.exists());

        // 剩下的可删文件都删掉也不够时，受保护的文件依旧保留
        assert!(!cache.ensure_space(950));
        assert!(oldest.exists());
    }

    #[test]
    fn test_touch_moves_file_to_the_back_of_eviction_order() {
        let (cache, _dir) = new_cache(1000);
        let oldest = cache.cache_file_for("http://h/oldest.mp4");
        let middle = cache.cache_file_for("http://h/middle.mp4");
        write_media(&oldest, 100, hours(3));
        write_media(&middle, 100, hours(2));

        cache.touch(&oldest);

        assert!(cache.ensure_space(850));
        assert!(oldest.exists());
        assert!(!middle.exists());
    }

    #[test]
    fn test_in_flight_part_files_are_not_evicted() {
        let (cache, _dir) = new_cache(1000);
        let mut name = cache
            .cache_file_for("http://h/a.mp4")
            .file_name()
            .unwrap()
            .to_os_string();
        name.push(".1.part");
        let part = cache.dir().join(name);
        write_media(&part, 300, hours(24 * 40));

        assert_eq!(cache.cleanup(true).deleted_count, 0);
        assert!(!cache.ensure_space(800));
        assert!(part.exists());
    }

    #[test]
    fn test_ensure_space_without_deletion_when_it_fits() {
        let (cache, _dir) = new_cache(1000);
        let path = cache.cache_file_for("http://h/a.mp4");
        write_media(&path, 100, hours(1));
        assert!(cache.ensure_space(500));
        assert!(path.exists());
    }

    #[test]
    fn test_ensure_space_fails_for_oversized_request() {
        let (cache, _dir) = new_cache(1000);
        let path = cache.cache_file_for("http://h/a.mp4");
        write_media(&path, 100, hours(1));
        assert!(!cache.ensure_space(1001));
        // 不可能满足的请求不应删除任何文件
        assert!(path.exists());
    }

    #[test]
    fn test_ensure_space_respects_free_space_floor() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_cache_bytes: 10_000,
            min_free_bytes: 500,
            max_age: constants::cache::MAX_AGE,
        };
        let cache = StorageCache::new(dir.path(), limits)
            .unwrap()
            .with_space_probe(Arc::new(FixedSpace(600)));
        // 600 - 200 < 500，且目录为空，无法腾出空间
        assert!(!cache.ensure_space(200));
        assert!(cache.ensure_space(100));
    }

    #[test]
    fn test_cleanup_removes_expired_files_without_pressure() {
        let (cache, _dir) = new_cache(1_000_000);
        let fresh = cache.cache_file_for("http://h/fresh.mp4");
        let stale = cache.cache_file_for("http://h/stale.mp4");
        write_media(&fresh, 100, hours(1));
        write_media(&stale, 100, hours(24 * 40));

        let report = cache.cleanup(false);
        assert_eq!(report.deleted_count, 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_cleanup_under_pressure_targets_seventy_percent() {
        let (cache, _dir) = new_cache(1000);
        let paths: Vec<_> = (0..4)
            .map(|i| cache.cache_file_for(&format!("http://h/{}.mp4", i)))
            .collect();
        for (i, path) in paths.iter().enumerate() {
            write_media(path, 250, hours(10 - i as u64));
        }

        let report = cache.cleanup(false);
        assert_eq!(report.deleted_count, 2);
        assert_eq!(report.freed_bytes, 500);
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
        assert!(paths[2].exists());
        assert!(paths[3].exists());
        assert_eq!(cache.total_size(), 500);
    }

    #[test]
    fn test_cleanup_is_noop_below_threshold() {
        let (cache, _dir) = new_cache(1000);
        write_media(&cache.cache_file_for("http://h/a.mp4"), 500, hours(1));
        assert_eq!(cache.cleanup(false), CleanupReport::default());
        // 用量已低于 70% 的目标，强制清理也无需删除
        let report = cache.cleanup(true);
        assert_eq!(report.deleted_count, 0);
    }

    #[test]
    fn test_retain_only_protects_the_kept_set_and_clear_all_resets_it() {
        let (cache, _dir) = new_cache(1000);
        let kept = cache.cache_file_for("http://h/kept.mp4");
        write_media(&kept, 100, hours(24 * 40));

        cache.retain_only(["http://h/kept.mp4"]);
        assert!(cache.is_protected(&kept));
        // 过期但仍在播放列表中
        assert_eq!(cache.cleanup(false).deleted_count, 0);
        assert!(kept.exists());

        cache.clear_all();
        assert!(!cache.is_protected(&kept));
    }

    #[test]
    fn test_clear_all_and_stats() {
        let (cache, _dir) = new_cache(1000);
        write_media(&cache.cache_file_for("http://h/a.mp4"), 100, hours(1));
        write_media(&cache.cache_file_for("http://h/b.mp4"), 300, hours(1));

        let stats = cache.stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 400);
        assert!((stats.usage_percentage() - 40.0).abs() < 1e-9);

        assert_eq!(cache.clear_all(), 2);
        assert_eq!(cache.total_size(), 0);
    }
}
