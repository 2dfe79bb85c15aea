//! # ソースマネージャ
//!
//! 読み込んだ各ファイルに32bitグローバル位置空間の連続区間を割り当て、
//! [`SourceLocation`] から（ファイル・オフセット・行・列）への解決を
//! 提供します。行インデックスはファイルごとに初回問い合わせ時に
//! 一度だけ構築されます。
//!
//! 並行性: ファイル登録は状態ロックで直列化され、位置カウンタは
//! 単調増加のアトミックです。行インデックス構築は `OnceLock` で
//! 排他され、構築後の読み取りは並行して安全です。直近の解決結果は
//! スレッドローカルの世代付きキャッシュで高速化され、テーブルの
//! 変更で世代が進むと権威パスに戻ります。

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use log::trace;
use rustc_hash::FxHashMap;

use crate::source::file_manager::{FileEntry, FileError, FileManager};
use crate::source::location::{FileId, FullSourceLoc, SourceLocation, SourceRange};
use crate::utils::interner::InternedString;

/// 読み込み済みファイル1件ぶんの管理情報
struct FileInfo {
    /// ファイル内容（FileManagerと共有所有）
    entry: Arc<FileEntry>,
    /// グローバル位置空間内でこのファイルが始まるオフセット
    start: u32,
    /// 各行の開始バイトオフセット（遅延構築、先頭は必ず0）
    line_offsets: OnceLock<Vec<u32>>,
}

impl FileInfo {
    /// グローバル位置空間内の終端（ファイル終端位置も表現可能な閉区間）
    fn end(&self) -> u32 {
        self.start + self.entry.size() as u32
    }
}

/// ファイルテーブルと名前索引
#[derive(Default)]
struct FileTable {
    files: Vec<FileInfo>,
    by_name: FxHashMap<InternedString, FileId>,
}

/// ソースマネージャの統計情報
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceManagerStats {
    /// 登録したファイル数
    pub file_load_count: usize,
    /// 予約した位置の総数
    pub location_create_count: usize,
    /// 行インデックスを構築した回数
    pub line_computation_count: usize,
    /// 登録済みソースの総バイト数
    pub source_size: usize,
}

impl std::fmt::Display for SourceManagerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SourceManager Statistics:")?;
        writeln!(f, "  Files loaded: {}", self.file_load_count)?;
        writeln!(f, "  Locations created: {}", self.location_create_count)?;
        writeln!(f, "  Line computations: {}", self.line_computation_count)?;
        write!(f, "  Total source size: {} bytes", self.source_size)
    }
}

/// 直近の位置解決結果のスレッドローカルキャッシュ
///
/// 字句解析や診断出力に典型的な逐次走査を高速化する。ヒットは
/// 任意の高速パスであり、ミスは必ず権威パスで再計算される。
#[derive(Clone, Copy)]
struct LocationCache {
    /// キャッシュ構築時のテーブル世代
    generation: u64,
    /// 位置の属するファイル
    fid: FileId,
    /// ファイル区間（グローバル空間、閉区間）
    file_start: u32,
    file_end: u32,
    /// 解決済みの行番号（0は未解決）
    line: u32,
    /// 行の開始・終端ファイルオフセット（終端は次行頭または size+1）
    line_start: u32,
    line_end: u32,
}

thread_local! {
    static LOCATION_CACHE: Cell<Option<LocationCache>> = const { Cell::new(None) };
}

/// ソースマネージャ
pub struct SourceManager {
    /// ファイルI/Oを担うファイルマネージャ
    file_manager: Arc<FileManager>,
    /// ファイルテーブル（書き込みは状態ロックで直列化）
    table: RwLock<FileTable>,
    /// 次に割り当てるグローバル位置（0は無効値として予約）
    next_location: AtomicU32,
    /// テーブル世代。変更のたびに進め、TLSキャッシュを無効化する。
    generation: AtomicU64,
    /// 統計情報
    stats: Mutex<SourceManagerStats>,
}

impl SourceManager {
    /// 新しいソースマネージャを作成
    pub fn new(file_manager: Arc<FileManager>) -> Self {
        Self {
            file_manager,
            table: RwLock::new(FileTable::default()),
            next_location: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            stats: Mutex::new(SourceManagerStats::default()),
        }
    }

    /// ファイルを読み込み、FileIDを割り当てる。
    /// 同じ正規化パスに対する2回目以降の呼び出しは既存IDを返す。
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> Result<FileId, FileError> {
        let entry = self.file_manager.get_file(path)?;
        Ok(self.create_file_from_entry(entry))
    }

    /// 読み込み済みエントリに対してFileIDを割り当てる
    pub fn create_file_from_entry(&self, entry: Arc<FileEntry>) -> FileId {
        let mut table = self.table.write().expect("source manager lock poisoned");

        // 登録済みなら既存IDを返す（ロック下で再確認）
        let filename = entry.filename();
        if let Some(&fid) = table.by_name.get(&filename) {
            return fid;
        }

        let size = entry.size();
        let span = size as u64 + 1; // ファイル終端位置もアドレス可能にする

        let start = self.next_location.load(Ordering::SeqCst);
        assert!(
            (start as u64) + span <= u32::MAX as u64,
            "global source location space exhausted"
        );
        self.next_location.fetch_add(span as u32, Ordering::SeqCst);

        table.files.push(FileInfo {
            entry,
            start,
            line_offsets: OnceLock::new(),
        });
        let fid = FileId::new(table.files.len() as u32);
        table.by_name.insert(filename, fid);

        self.generation.fetch_add(1, Ordering::Release);

        let mut stats = self.stats.lock().unwrap();
        stats.file_load_count += 1;
        stats.location_create_count += span as usize;
        stats.source_size += size;

        fid
    }

    /// ファイル先頭の位置を取得
    pub fn start_loc(&self, fid: FileId) -> SourceLocation {
        let table = self.table.read().expect("source manager lock poisoned");
        match self.file_info(&table, fid) {
            Some(info) => SourceLocation::from_raw_encoding(info.start),
            None => SourceLocation::invalid(),
        }
    }

    /// ファイル終端の位置を取得（最後のバイトの直後を指す）
    pub fn end_loc(&self, fid: FileId) -> SourceLocation {
        let table = self.table.read().expect("source manager lock poisoned");
        match self.file_info(&table, fid) {
            Some(info) => SourceLocation::from_raw_encoding(info.end()),
            None => SourceLocation::invalid(),
        }
    }

    /// ファイル内オフセットから位置を生成。
    /// オフセットは `0..=size` の範囲であること。範囲外は無効位置。
    pub fn loc_for_file_offset(&self, fid: FileId, offset: u32) -> SourceLocation {
        let table = self.table.read().expect("source manager lock poisoned");
        match self.file_info(&table, fid) {
            Some(info) if offset as usize <= info.entry.size() => {
                SourceLocation::from_raw_encoding(info.start + offset)
            }
            _ => SourceLocation::invalid(),
        }
    }

    /// 位置の属するファイルを特定する。
    /// どのファイルの区間にも入らない値には無効IDを返す。
    pub fn file_id(&self, loc: SourceLocation) -> FileId {
        if loc.is_invalid() {
            return FileId::invalid();
        }
        let raw = loc.raw_encoding();

        // 速いパス: 直近に解決したファイルの区間内か
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(cache) = LOCATION_CACHE.with(|c| c.get()) {
            if cache.generation == generation
                && raw >= cache.file_start
                && raw <= cache.file_end
            {
                return cache.fid;
            }
        }

        let table = self.table.read().expect("source manager lock poisoned");
        let (fid, info) = match self.find_file(&table, raw) {
            Some(found) => found,
            None => return FileId::invalid(),
        };

        LOCATION_CACHE.with(|c| {
            c.set(Some(LocationCache {
                generation,
                fid,
                file_start: info.start,
                file_end: info.end(),
                line: 0,
                line_start: 0,
                line_end: 0,
            }))
        });

        fid
    }

    /// 位置のファイル内バイトオフセットを取得。無効位置は0。
    pub fn file_offset(&self, loc: SourceLocation) -> u32 {
        if loc.is_invalid() {
            return 0;
        }
        let table = self.table.read().expect("source manager lock poisoned");
        match self.find_file(&table, loc.raw_encoding()) {
            Some((_, info)) => loc.raw_encoding() - info.start,
            None => 0,
        }
    }

    /// FileIDに対応するファイルエントリを取得
    pub fn file_entry(&self, fid: FileId) -> Option<Arc<FileEntry>> {
        let table = self.table.read().expect("source manager lock poisoned");
        self.file_info(&table, fid).map(|info| Arc::clone(&info.entry))
    }

    /// 位置に対応するファイルエントリを取得
    pub fn file_entry_for_loc(&self, loc: SourceLocation) -> Option<Arc<FileEntry>> {
        let fid = self.file_id(loc);
        if fid.is_invalid() {
            return None;
        }
        self.file_entry(fid)
    }

    /// 位置のファイル名を取得。解決できない場合は無効ハンドル。
    pub fn filename(&self, loc: SourceLocation) -> InternedString {
        let fid = self.file_id(loc);
        self.filename_for_id(fid)
    }

    /// FileIDのファイル名を取得
    pub fn filename_for_id(&self, fid: FileId) -> InternedString {
        let table = self.table.read().expect("source manager lock poisoned");
        match self.file_info(&table, fid) {
            Some(info) => info.entry.filename(),
            None => InternedString::invalid(),
        }
    }

    /// 行番号（1始まり）を取得。無効位置は0。
    pub fn line_number(&self, loc: SourceLocation) -> u32 {
        self.line_and_column(loc).0
    }

    /// 列番号（1始まり）を取得。無効位置は0。
    pub fn column_number(&self, loc: SourceLocation) -> u32 {
        self.line_and_column(loc).1
    }

    /// 行・列（いずれも1始まり）を取得。無効位置は `(0, 0)`。
    pub fn line_and_column(&self, loc: SourceLocation) -> (u32, u32) {
        if loc.is_invalid() {
            return (0, 0);
        }
        let raw = loc.raw_encoding();

        // 速いパス: 同一世代・同一ファイル・キャッシュ済み行の範囲内
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(cache) = LOCATION_CACHE.with(|c| c.get()) {
            if cache.generation == generation
                && cache.line > 0
                && raw >= cache.file_start
                && raw <= cache.file_end
            {
                let offset = raw - cache.file_start;
                if offset >= cache.line_start && offset < cache.line_end {
                    return (cache.line, offset - cache.line_start + 1);
                }
            }
        }

        self.resolve_line_and_column(loc, generation)
    }

    /// ファイルの行数を取得（`\n` の数 + 1）
    pub fn line_count(&self, fid: FileId) -> usize {
        let table = self.table.read().expect("source manager lock poisoned");
        match self.file_info(&table, fid) {
            Some(info) => self.line_offsets(info).len(),
            None => 0,
        }
    }

    /// 位置以降のバイトデータを取得。
    /// オフセットがファイルサイズ以上のときは `None`。
    pub fn character_data(&self, loc: SourceLocation) -> Option<&[u8]> {
        let table = self.table.read().expect("source manager lock poisoned");
        let (_, info) = self.find_file(&table, loc.raw_encoding())?;
        let offset = (loc.raw_encoding() - info.start) as usize;
        if offset >= info.entry.size() {
            return None;
        }

        let ptr = info.entry.buffer().as_ptr();
        let len = info.entry.size() - offset;
        // 安全性: エントリのバッファはArcで共有所有され、テーブルから
        // 除去するAPIは存在しない。`&self` が生きている間は解放も移動も
        // 起きないため、ロック解放後も参照は有効である。
        Some(unsafe { std::slice::from_raw_parts(ptr.add(offset), len) })
    }

    /// 範囲のソーステキストを取得。
    /// 両端が異なるファイルに属する場合は空文字列。
    pub fn source_text(&self, range: SourceRange) -> String {
        self.source_text_between(range.begin, range.end)
    }

    /// `[begin, end)` のソーステキストを取得
    pub fn source_text_between(&self, begin: SourceLocation, end: SourceLocation) -> String {
        if begin.is_invalid() || end.is_invalid() {
            return String::new();
        }

        let table = self.table.read().expect("source manager lock poisoned");
        let (begin_fid, info) = match self.find_file(&table, begin.raw_encoding()) {
            Some(found) => found,
            None => return String::new(),
        };
        let end_fid = match self.find_file(&table, end.raw_encoding()) {
            Some((fid, _)) => fid,
            None => return String::new(),
        };
        if begin_fid != end_fid {
            return String::new(); // ファイルをまたぐ範囲は対象外
        }

        let start = (begin.raw_encoding() - info.start) as usize;
        let stop = (end.raw_encoding() - info.start) as usize;
        if start > stop {
            return String::new();
        }
        let stop = stop.min(info.entry.size());

        String::from_utf8_lossy(&info.entry.as_bytes()[start..stop]).into_owned()
    }

    /// 2つの位置の間のバイト数を取得。無効・逆順・別ファイルは0。
    pub fn source_length(&self, begin: SourceLocation, end: SourceLocation) -> usize {
        if begin.is_invalid() || end.is_invalid() {
            return 0;
        }
        let begin_fid = self.file_id(begin);
        let end_fid = self.file_id(end);
        if begin_fid.is_invalid() || begin_fid != end_fid {
            return 0;
        }
        let begin_off = self.file_offset(begin);
        let end_off = self.file_offset(end);
        if end_off >= begin_off {
            (end_off - begin_off) as usize
        } else {
            0
        }
    }

    /// 位置が有効で、いずれかのファイルに属しているか確認
    pub fn is_valid_location(&self, loc: SourceLocation) -> bool {
        loc.is_valid() && self.file_id(loc).is_valid()
    }

    /// ソース順で `lhs` が `rhs` より前かどうか。
    /// 同一ファイル内、またはファイル間では発行順で定義される。
    pub fn is_before_in_source_order(&self, lhs: SourceLocation, rhs: SourceLocation) -> bool {
        if lhs.is_invalid() || rhs.is_invalid() {
            return false;
        }
        lhs.raw_encoding() < rhs.raw_encoding()
    }

    /// 位置を `num_bytes` 進める。ファイル区間を超える場合は無効位置。
    pub fn advance_loc(&self, loc: SourceLocation, num_bytes: u32) -> SourceLocation {
        if loc.is_invalid() {
            return SourceLocation::invalid();
        }
        let table = self.table.read().expect("source manager lock poisoned");
        match self.find_file(&table, loc.raw_encoding()) {
            Some((_, info)) => {
                let offset = loc.raw_encoding() - info.start;
                if offset as u64 + num_bytes as u64 > info.entry.size() as u64 {
                    SourceLocation::invalid()
                } else {
                    SourceLocation::from_raw_encoding(loc.raw_encoding() + num_bytes)
                }
            }
            None => SourceLocation::invalid(),
        }
    }

    /// SourceManagerへの参照付き位置情報を取得
    pub fn full_loc(&self, loc: SourceLocation) -> FullSourceLoc<'_> {
        FullSourceLoc::new(loc, self)
    }

    /// 登録済みファイル数を取得
    pub fn file_count(&self) -> usize {
        let table = self.table.read().expect("source manager lock poisoned");
        table.files.len()
    }

    /// 統計情報を取得
    pub fn stats(&self) -> SourceManagerStats {
        *self.stats.lock().unwrap()
    }

    /// 下位のファイルマネージャを取得
    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    /// 行インデックスのキャッシュを破棄する。
    /// ファイルエントリ自体はFileManager経由で生存し続ける。
    pub fn clear_cache(&self) {
        let mut table = self.table.write().expect("source manager lock poisoned");
        for info in table.files.iter_mut() {
            info.line_offsets = OnceLock::new();
        }
        // スレッドローカルキャッシュを世代で無効化する
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// FileIDからFileInfoを引く（無効・範囲外はNone）
    fn file_info<'t>(&self, table: &'t FileTable, fid: FileId) -> Option<&'t FileInfo> {
        if fid.is_invalid() {
            return None;
        }
        table.files.get(fid.index())
    }

    /// 生の位置値からファイルを二分探索で特定する
    fn find_file<'t>(&self, table: &'t FileTable, raw: u32) -> Option<(FileId, &'t FileInfo)> {
        if raw == 0 || table.files.is_empty() {
            return None;
        }

        // start <= raw を満たす最後のファイル
        let idx = table.files.partition_point(|info| info.start <= raw);
        if idx == 0 {
            return None;
        }
        let info = &table.files[idx - 1];

        if raw < info.start || raw > info.end() {
            return None;
        }
        Some((FileId::new(idx as u32), info))
    }

    /// 行インデックスを取得。未構築なら構築する（ファイルごとに高々1回）。
    fn line_offsets<'t>(&self, info: &'t FileInfo) -> &'t Vec<u32> {
        info.line_offsets.get_or_init(|| {
            self.stats.lock().unwrap().line_computation_count += 1;
            trace!(
                "computing line offsets for {}",
                info.entry.filename().to_string_lossy()
            );

            let data = info.entry.as_bytes();
            let mut offsets = Vec::with_capacity(data.len() / 40 + 16);
            offsets.push(0u32); // 1行目はオフセット0から始まる
            for (i, &byte) in data.iter().enumerate() {
                if byte == b'\n' {
                    offsets.push((i + 1) as u32);
                }
            }
            offsets
        })
    }

    /// 権威パス: 行・列をテーブルから解決し、TLSキャッシュを更新する
    fn resolve_line_and_column(&self, loc: SourceLocation, generation: u64) -> (u32, u32) {
        let raw = loc.raw_encoding();
        let table = self.table.read().expect("source manager lock poisoned");
        let (fid, info) = match self.find_file(&table, raw) {
            Some(found) => found,
            None => return (0, 0),
        };

        let offsets = self.line_offsets(info);
        let offset = raw - info.start;

        // offsets は昇順で先頭0。offset 以下の要素数がそのまま1始まりの行番号。
        let line = offsets.partition_point(|&o| o <= offset) as u32;
        debug_assert!(line >= 1);

        let line_start = offsets[(line - 1) as usize];
        let line_end = offsets
            .get(line as usize)
            .copied()
            .unwrap_or(info.entry.size() as u32 + 1);
        let column = offset - line_start + 1;

        LOCATION_CACHE.with(|c| {
            c.set(Some(LocationCache {
                generation,
                fid,
                file_start: info.start,
                file_end: info.end(),
                line,
                line_start,
                line_end,
            }))
        });

        (line, column)
    }
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("files", &self.file_count())
            .field("next_location", &self.next_location.load(Ordering::Relaxed))
            .finish()
    }
}
