//! # ファイルマネージャ
//!
//! ディスク上のファイルを一度だけ読み込み、正規化パスをキーに
//! キャッシュします。読み込んだ内容は [`FileEntry`] として共有所有
//! （`Arc`）され、参照する `SourceManager` より長生きします。
//!
//! バッファは必ず `サイズ + 1` バイトで確保され、末尾がNULである
//! ことを下流コードが前提にできます。

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use log::{debug, warn};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::utils::interner::{InternedString, StringInterner};

/// ファイル操作のエラー
#[derive(Debug, Error)]
pub enum FileError {
    /// ファイルが存在しない
    #[error("ファイルが見つかりません: {path}")]
    NotFound {
        /// 対象のパス
        path: PathBuf,
    },

    /// その他のI/O障害
    #[error("I/Oエラー ({path}): {source}")]
    Io {
        /// 対象のパス
        path: PathBuf,
        /// 元のI/Oエラー
        #[source]
        source: io::Error,
    },
}

impl FileError {
    fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            FileError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            FileError::Io {
                path: path.to_path_buf(),
                source: err,
            }
        }
    }
}

/// メモリ上のファイル内容
///
/// 構築後は不変。バッファ末尾には必ずNULが付加されています。
#[derive(Debug)]
pub struct FileEntry {
    /// 正規化済みファイル名（インターン済み）
    filename: InternedString,
    /// ファイル内容 + 終端NUL（長さは `size + 1`）
    data: Box<[u8]>,
    /// ファイルサイズ（NULを含まない）
    size: usize,
    /// 最終更新時刻
    mod_time: SystemTime,
}

impl FileEntry {
    /// 新しいFileEntryを作成。`data` は末尾NUL付きであること。
    pub(crate) fn new(
        filename: InternedString,
        data: Box<[u8]>,
        size: usize,
        mod_time: SystemTime,
    ) -> Self {
        debug_assert_eq!(data.len(), size + 1);
        debug_assert_eq!(data[size], 0);
        Self {
            filename,
            data,
            size,
            mod_time,
        }
    }

    /// 正規化済みファイル名を取得
    pub fn filename(&self) -> InternedString {
        self.filename
    }

    /// ファイル内容を取得（終端NULを含まない）
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// 終端NULを含む全バッファを取得
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    /// ファイルサイズを取得（バイト）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 最終更新時刻を取得
    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }
}

/// ファイル操作の統計情報
#[derive(Debug, Clone, Copy, Default)]
pub struct FileManagerStats {
    /// ディスクからの読み込み回数
    pub file_open_count: usize,
    /// キャッシュ内のエントリ数
    pub cache_entry_count: usize,
    /// 読み込んだ総バイト数
    pub bytes_read: usize,
    /// キャッシュヒット数
    pub cache_hit_count: usize,
    /// キャッシュミス数
    pub cache_miss_count: usize,
}

impl std::fmt::Display for FileManagerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "FileManager Statistics:")?;
        writeln!(f, "  Files opened: {}", self.file_open_count)?;
        writeln!(f, "  Cache entries: {}", self.cache_entry_count)?;
        writeln!(f, "  Bytes read: {}", self.bytes_read)?;
        writeln!(f, "  Cache hits: {}", self.cache_hit_count)?;
        write!(f, "  Cache misses: {}", self.cache_miss_count)
    }
}

/// ファイルの読み込みとキャッシュを管理する
///
/// スレッド安全。同一の正規化パスに対する読み込みは高々1回で、
/// 並行する読み込み競争は先着が勝ちます。
pub struct FileManager {
    /// パス文字列のインターンに使うインターナ
    interner: Arc<StringInterner>,
    /// 正規化パス → エントリのキャッシュ
    cache: Mutex<FxHashMap<InternedString, Arc<FileEntry>>>,
    /// キャッシュ容量の上限（バイト）。`usize::MAX` は無制限。
    max_cache_size: Mutex<usize>,
    /// 統計情報
    stats: Mutex<FileManagerStats>,
}

impl FileManager {
    /// 新しいファイルマネージャを作成
    pub fn new(interner: Arc<StringInterner>) -> Self {
        Self {
            interner,
            cache: Mutex::new(FxHashMap::default()),
            max_cache_size: Mutex::new(usize::MAX),
            stats: Mutex::new(FileManagerStats::default()),
        }
    }

    /// ファイルを取得する。未キャッシュならディスクから読み込む。
    ///
    /// 返るエントリはこのマネージャの破棄または
    /// [`FileManager::clear_cache`] まで（および参照者が `Arc` を
    /// 保持する限り）有効です。
    pub fn get_file<P: AsRef<Path>>(&self, path: P) -> Result<Arc<FileEntry>, FileError> {
        let normalized = self.normalize_path(path.as_ref());
        let interned = self.intern_path(&normalized);

        {
            let cache = self.cache.lock().expect("file cache lock poisoned");
            if let Some(entry) = cache.get(&interned) {
                self.stats.lock().unwrap().cache_hit_count += 1;
                return Ok(Arc::clone(entry));
            }
            self.stats.lock().unwrap().cache_miss_count += 1;
        }

        // 読み込みはロックの外で行う
        let entry = self.load_file(&normalized, interned)?;

        let mut cache = self.cache.lock().expect("file cache lock poisoned");

        // 読み込み中に他スレッドが先に登録していれば、そちらを採用する
        if let Some(existing) = cache.get(&interned) {
            self.stats.lock().unwrap().cache_hit_count += 1;
            return Ok(Arc::clone(existing));
        }

        cache.insert(interned, Arc::clone(&entry));
        self.stats.lock().unwrap().cache_entry_count += 1;

        self.evict_if_needed(&mut cache);

        Ok(entry)
    }

    /// ファイルが存在するか確認（読み込みはしない）
    pub fn file_exists<P: AsRef<Path>>(&self, path: P) -> bool {
        let normalized = self.normalize_path(path.as_ref());
        let interned = self.intern_path(&normalized);

        {
            let cache = self.cache.lock().expect("file cache lock poisoned");
            if cache.contains_key(&interned) {
                return true;
            }
        }

        normalized.is_file()
    }

    /// ファイルサイズを取得（読み込みはしない）
    pub fn file_size<P: AsRef<Path>>(&self, path: P) -> Result<u64, FileError> {
        let normalized = self.normalize_path(path.as_ref());
        let interned = self.intern_path(&normalized);

        {
            let cache = self.cache.lock().expect("file cache lock poisoned");
            if let Some(entry) = cache.get(&interned) {
                return Ok(entry.size() as u64);
            }
        }

        fs::metadata(&normalized)
            .map(|meta| meta.len())
            .map_err(|e| FileError::from_io(&normalized, e))
    }

    /// ファイルの最終更新時刻を取得
    pub fn file_mod_time<P: AsRef<Path>>(&self, path: P) -> Result<SystemTime, FileError> {
        let normalized = self.normalize_path(path.as_ref());
        let interned = self.intern_path(&normalized);

        {
            let cache = self.cache.lock().expect("file cache lock poisoned");
            if let Some(entry) = cache.get(&interned) {
                return Ok(entry.mod_time());
            }
        }

        fs::metadata(&normalized)
            .and_then(|meta| meta.modified())
            .map_err(|e| FileError::from_io(&normalized, e))
    }

    /// 指定ファイルをキャッシュから除去
    pub fn remove_from_cache<P: AsRef<Path>>(&self, path: P) {
        let normalized = self.normalize_path(path.as_ref());
        let interned = self.intern_path(&normalized);

        let mut cache = self.cache.lock().expect("file cache lock poisoned");
        if cache.remove(&interned).is_some() {
            let mut stats = self.stats.lock().unwrap();
            stats.cache_entry_count = stats.cache_entry_count.saturating_sub(1);
        }
    }

    /// キャッシュを全消去する。配布済みの `Arc` は参照者が保持する限り有効。
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().expect("file cache lock poisoned");
        cache.clear();
        self.stats.lock().unwrap().cache_entry_count = 0;
    }

    /// キャッシュ容量の上限を設定（バイト）
    pub fn set_max_cache_size(&self, max_size: usize) {
        *self.max_cache_size.lock().unwrap() = max_size;
    }

    /// キャッシュ容量の上限を取得
    pub fn max_cache_size(&self) -> usize {
        *self.max_cache_size.lock().unwrap()
    }

    /// 現在のキャッシュサイズを取得（バイト）
    pub fn current_cache_size(&self) -> usize {
        let cache = self.cache.lock().expect("file cache lock poisoned");
        cache.values().map(|entry| entry.size()).sum()
    }

    /// 統計情報を取得
    pub fn stats(&self) -> FileManagerStats {
        *self.stats.lock().unwrap()
    }

    /// パス文字列のインターンに使っているインターナを取得
    pub fn interner(&self) -> &Arc<StringInterner> {
        &self.interner
    }

    /// ディスクからファイルを読み込む
    fn load_file(
        &self,
        path: &Path,
        filename: InternedString,
    ) -> Result<Arc<FileEntry>, FileError> {
        let metadata = fs::metadata(path).map_err(|e| FileError::from_io(path, e))?;
        if !metadata.is_file() {
            return Err(FileError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let size = metadata.len() as usize;
        let mod_time = metadata.modified().map_err(|e| FileError::from_io(path, e))?;

        let mut file = fs::File::open(path).map_err(|e| FileError::from_io(path, e))?;

        // 終端NULのぶんを含めて確保する
        let mut buffer = Vec::with_capacity(size + 1);
        file.read_to_end(&mut buffer)
            .map_err(|e| FileError::from_io(path, e))?;

        // stat後に伸縮したファイルにも追従する
        let size = buffer.len();
        buffer.push(0);

        {
            let mut stats = self.stats.lock().unwrap();
            stats.file_open_count += 1;
            stats.bytes_read += size;
        }

        debug!("loaded {} ({} bytes)", path.display(), size);

        Ok(Arc::new(FileEntry::new(
            filename,
            buffer.into_boxed_slice(),
            size,
            mod_time,
        )))
    }

    /// キャッシュサイズが上限を超えていればエントリを追い出す
    fn evict_if_needed(&self, cache: &mut FxHashMap<InternedString, Arc<FileEntry>>) {
        let max_size = *self.max_cache_size.lock().unwrap();
        if max_size == usize::MAX {
            return;
        }

        let mut current: usize = cache.values().map(|entry| entry.size()).sum();
        if current <= max_size {
            return;
        }

        // 上限を下回るまで追い出す（アクセス時刻は追跡しないため順不同）
        let victims: Vec<InternedString> = cache.keys().copied().collect();
        for key in victims {
            if current <= max_size {
                break;
            }
            if let Some(entry) = cache.remove(&key) {
                current -= entry.size();
                let mut stats = self.stats.lock().unwrap();
                stats.cache_entry_count = stats.cache_entry_count.saturating_sub(1);
                warn!("evicted {} from file cache", key.to_string_lossy());
            }
        }
    }

    /// パスを正規化する。正規化に失敗した場合は元のパスを使う。
    fn normalize_path(&self, path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn intern_path(&self, path: &Path) -> InternedString {
        self.interner.intern(path.to_string_lossy().as_bytes())
    }
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("cached_files", &self.cache.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_load_caches_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.lm", b"let x = 1;");
        let manager = FileManager::new(Arc::new(StringInterner::new()));

        let entry = manager.get_file(&path).unwrap();
        assert_eq!(entry.as_bytes(), b"let x = 1;");
        assert_eq!(entry.size(), 10);
        assert_eq!(entry.buffer().len(), 11);
        assert_eq!(entry.buffer()[10], 0);

        // 2回目はキャッシュから同一エントリが返る
        let again = manager.get_file(&path).unwrap();
        assert!(Arc::ptr_eq(&entry, &again));

        let stats = manager.stats();
        assert_eq!(stats.file_open_count, 1);
        assert_eq!(stats.cache_hit_count, 1);
        assert_eq!(stats.cache_miss_count, 1);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let manager = FileManager::new(Arc::new(StringInterner::new()));
        let err = manager.get_file("/no/such/file.lm").unwrap_err();
        assert!(matches!(err, FileError::NotFound { .. }));
    }

    #[test]
    fn test_file_exists_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "b.lm", b"abc");
        let manager = FileManager::new(Arc::new(StringInterner::new()));

        assert!(manager.file_exists(&path));
        assert!(!manager.file_exists(dir.path().join("nope.lm")));
        assert_eq!(manager.file_size(&path).unwrap(), 3);
    }

    #[test]
    fn test_remove_and_clear_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "c.lm", b"abc");
        let manager = FileManager::new(Arc::new(StringInterner::new()));

        let entry = manager.get_file(&path).unwrap();
        manager.remove_from_cache(&path);
        assert_eq!(manager.current_cache_size(), 0);

        // 除去後も配布済みArcは有効
        assert_eq!(entry.as_bytes(), b"abc");

        manager.get_file(&path).unwrap();
        manager.clear_cache();
        assert_eq!(manager.stats().cache_entry_count, 0);
    }

    #[test]
    fn test_eviction_on_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a.lm", &[b'a'; 64]);
        let b = write_temp(&dir, "b.lm", &[b'b'; 64]);
        let manager = FileManager::new(Arc::new(StringInterner::new()));
        manager.set_max_cache_size(100);

        manager.get_file(&a).unwrap();
        manager.get_file(&b).unwrap();

        // 128バイトは上限100を超えるため、少なくとも1件追い出される
        assert!(manager.current_cache_size() <= 100);
    }

    #[test]
    fn test_canonical_path_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "d.lm", b"abc");
        let manager = FileManager::new(Arc::new(StringInterner::new()));

        let direct = manager.get_file(&path).unwrap();
        // 非正規形のパスでも同一エントリに解決される
        let dotted = dir.path().join(".").join("d.lm");
        let via_dot = manager.get_file(&dotted).unwrap();
        assert!(Arc::ptr_eq(&direct, &via_dot));
    }
}
