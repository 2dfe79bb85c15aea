//! # アリーナアロケータ
//!
//! 短命な多数オブジェクト向けのバンプアロケータです。
//! 大きなチャンク単位でメモリを確保し、個々の割り当ては
//! カーソルを進めるだけで完了します。割り当てたメモリの
//! アドレスはアリーナの生存期間中は移動しません。
//! インターナの文字列格納先としての利用を想定しています。
//!
//! スレッド安全ではありません。単一スレッドのフロントエンド
//! フェーズ、または単一のインターナによる占有利用を前提とします。

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

/// アリーナ使用状況の統計情報
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaStats {
    /// システムから確保した総バイト数
    pub allocated_bytes: usize,
    /// 利用側が要求した総バイト数
    pub requested_bytes: usize,
    /// 割り当て呼び出し回数
    pub allocation_count: usize,
    /// チャンク数
    pub chunk_count: usize,
    /// ピーク使用量（バイト）
    pub peak_usage: usize,
    /// 現在の使用量（バイト）
    pub current_usage: usize,
    /// アラインメント調整で失われたバイト数
    pub wasted_bytes: usize,
}

impl ArenaStats {
    /// 断片化率を取得（0.0〜1.0）
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.requested_bytes > 0 {
            self.wasted_bytes as f64 / self.requested_bytes as f64
        } else {
            0.0
        }
    }

    /// 割り当て効率を取得（0.0〜1.0）
    pub fn efficiency(&self) -> f64 {
        if self.allocated_bytes > 0 {
            self.requested_bytes as f64 / self.allocated_bytes as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Arena Allocator Statistics:")?;
        writeln!(f, "  Total allocated: {} bytes", self.allocated_bytes)?;
        writeln!(f, "  Total requested: {} bytes", self.requested_bytes)?;
        writeln!(f, "  Current usage: {} bytes", self.current_usage)?;
        writeln!(f, "  Peak usage: {} bytes", self.peak_usage)?;
        writeln!(f, "  Number of allocations: {}", self.allocation_count)?;
        writeln!(f, "  Number of chunks: {}", self.chunk_count)?;
        writeln!(f, "  Wasted bytes: {} bytes", self.wasted_bytes)?;
        writeln!(
            f,
            "  Fragmentation ratio: {:.2}%",
            self.fragmentation_ratio() * 100.0
        )?;
        write!(f, "  Efficiency: {:.2}%", self.efficiency() * 100.0)
    }
}

/// アリーナが管理するメモリチャンク
struct ArenaChunk {
    /// チャンクの先頭アドレス
    memory: NonNull<u8>,
    /// 確保時のレイアウト（解放に使用）
    layout: Layout,
    /// チャンク全体のサイズ（バイト）
    size: usize,
    /// 使用済みバイト数
    used: usize,
}

impl ArenaChunk {
    fn new(size: usize) -> Self {
        // アラインメントはチャンク先頭で最大要求を満たしておく
        let layout = Layout::from_size_align(size, Arena::DEFAULT_ALIGNMENT)
            .expect("invalid arena chunk layout");
        let memory = unsafe { alloc::alloc(layout) };
        let memory = NonNull::new(memory).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self {
            memory,
            layout,
            size,
            used: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.size - self.used
    }

    /// チャンク内から割り当てる。収まらない場合は `None`。
    fn allocate(&mut self, size: usize, align: usize) -> Option<(NonNull<u8>, usize)> {
        let base = self.memory.as_ptr() as usize + self.used;
        let aligned = (base + align - 1) & !(align - 1);
        let padding = aligned - base;
        let total = padding + size;

        if total > self.remaining() {
            return None;
        }

        self.used += total;
        // 安全性: aligned はチャンク範囲内を指し、この領域はまだ誰にも渡していない
        let ptr = unsafe { NonNull::new_unchecked(aligned as *mut u8) };
        Some((ptr, total))
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.memory.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.used
    }
}

impl Drop for ArenaChunk {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.memory.as_ptr(), self.layout);
        }
    }
}

/// アリーナアロケータ
///
/// チャンクのリストを保持し、現在のチャンクに収まらない要求が
/// 来たときだけ新しいチャンクを確保します。個々の割り当ての
/// 解放は提供せず、[`Arena::reset`] / [`Arena::clear`] で一括解放します。
pub struct Arena {
    /// メモリチャンクのリスト（末尾が現在のチャンク）
    chunks: RefCell<Vec<ArenaChunk>>,
    /// 新規チャンクの基準サイズ
    chunk_size: Cell<usize>,
    /// 統計情報
    stats: RefCell<ArenaStats>,
}

impl Arena {
    /// デフォルトのチャンクサイズ（1MiB）
    pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

    /// 最小のチャンクサイズ（1KiB）
    pub const MIN_CHUNK_SIZE: usize = 1024;

    /// 1回の割り当てで受け付ける最大サイズ（512KiB）
    pub const MAX_ALLOCATION_SIZE: usize = 512 * 1024;

    /// デフォルトのアラインメント
    pub const DEFAULT_ALIGNMENT: usize = std::mem::align_of::<usize>() * 2;

    /// チャンクサイズの上限（100MiB）
    const CHUNK_SIZE_LIMIT: usize = 100 * 1024 * 1024;

    /// デフォルト設定でアリーナを作成
    pub fn new() -> Self {
        Self::with_chunk_size(Self::DEFAULT_CHUNK_SIZE)
    }

    /// チャンクサイズを指定してアリーナを作成
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let arena = Self {
            chunks: RefCell::new(Vec::new()),
            chunk_size: Cell::new(chunk_size.max(Self::MIN_CHUNK_SIZE)),
            stats: RefCell::new(ArenaStats::default()),
        };
        arena.allocate_new_chunk(0);
        arena
    }

    /// 生のメモリ割り当て。アラインメント指定付き。
    ///
    /// サイズ0、または [`Arena::MAX_ALLOCATION_SIZE`] を超える要求は `None`。
    pub fn alloc_raw(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > Self::MAX_ALLOCATION_SIZE {
            return None;
        }

        let align = align.max(Self::DEFAULT_ALIGNMENT).next_power_of_two();

        // まず現在のチャンクから試す
        if let Some((ptr, actual)) = self
            .chunks
            .borrow_mut()
            .last_mut()
            .and_then(|chunk| chunk.allocate(size, align))
        {
            self.update_stats(size, actual);
            return Some(ptr);
        }

        // 新しいチャンクを確保して再試行
        let needed = size + align - 1;
        self.allocate_new_chunk(needed);

        let (ptr, actual) = self
            .chunks
            .borrow_mut()
            .last_mut()
            .and_then(|chunk| chunk.allocate(size, align))?;
        self.update_stats(size, actual);
        Some(ptr)
    }

    /// バイト列をアリーナにコピーし、末尾にNULを付加する。
    /// 返るポインタはNUL終端バイト列の先頭を指し、アリーナの
    /// 生存期間中は移動しない。
    pub fn alloc_terminated(&self, bytes: &[u8]) -> Option<NonNull<u8>> {
        let ptr = self.alloc_raw(bytes.len() + 1, 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            *ptr.as_ptr().add(bytes.len()) = 0;
        }
        Some(ptr)
    }

    /// 文字列をアリーナにコピーする（NUL終端付きで格納、返り値はNULを含まない）
    pub fn alloc_str<'a>(&'a self, s: &str) -> Option<&'a str> {
        let ptr = self.alloc_terminated(s.as_bytes())?;
        // 安全性: 直前に書き込んだUTF-8バイト列で、アドレスは移動しない
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), s.len());
            Some(std::str::from_utf8_unchecked(slice))
        }
    }

    /// バイト列をアリーナにコピーする（NUL終端付きで格納、返り値はNULを含まない）
    pub fn alloc_bytes<'a>(&'a self, bytes: &[u8]) -> Option<&'a [u8]> {
        let ptr = self.alloc_terminated(bytes)?;
        unsafe { Some(std::slice::from_raw_parts(ptr.as_ptr(), bytes.len())) }
    }

    /// 全チャンクを解放し、新しい初期チャンクを確保する。
    /// 既存の割り当てはすべて無効になる。
    pub fn reset(&mut self) {
        self.chunks.borrow_mut().clear();
        *self.stats.borrow_mut() = ArenaStats::default();
        self.allocate_new_chunk(0);
    }

    /// 各チャンクの使用カーソルを先頭に巻き戻す。メモリは解放しない。
    /// 既存の割り当ては上書きされうるため無効になる。
    pub fn clear(&mut self) {
        for chunk in self.chunks.borrow_mut().iter_mut() {
            chunk.used = 0;
        }
        let mut stats = self.stats.borrow_mut();
        stats.current_usage = 0;
        stats.allocation_count = 0;
    }

    /// ポインタがこのアリーナの使用済み領域を指しているか確認
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.chunks.borrow().iter().any(|chunk| chunk.contains(ptr))
    }

    /// システムから確保した総バイト数
    pub fn total_allocated(&self) -> usize {
        self.chunks.borrow().iter().map(|chunk| chunk.size).sum()
    }

    /// 使用済みの総バイト数
    pub fn total_used(&self) -> usize {
        self.chunks.borrow().iter().map(|chunk| chunk.used).sum()
    }

    /// 現在の統計情報を取得
    pub fn stats(&self) -> ArenaStats {
        let mut stats = *self.stats.borrow();
        stats.current_usage = self.total_used();
        stats.peak_usage = stats.peak_usage.max(stats.current_usage);
        self.stats.borrow_mut().peak_usage = stats.peak_usage;
        stats
    }

    /// 以降の新規チャンクの基準サイズを設定
    pub fn set_chunk_size(&self, size: usize) {
        self.chunk_size.set(size.max(Self::MIN_CHUNK_SIZE));
    }

    /// 現在のチャンク基準サイズを取得
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    fn allocate_new_chunk(&self, min_size: usize) {
        let size = min_size
            .max(self.chunk_size.get())
            .min(Self::CHUNK_SIZE_LIMIT);
        self.chunks.borrow_mut().push(ArenaChunk::new(size));

        let mut stats = self.stats.borrow_mut();
        stats.chunk_count += 1;
        stats.allocated_bytes += size;
    }

    fn update_stats(&self, requested: usize, allocated: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.allocation_count += 1;
        stats.requested_bytes += requested;
        stats.current_usage += allocated;
        stats.peak_usage = stats.peak_usage.max(stats.current_usage);
        if allocated > requested {
            stats.wasted_bytes += allocated - requested;
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("chunk_size", &self.chunk_size.get())
            .field("chunks", &self.chunks.borrow().len())
            .field("total_used", &self.total_used())
            .finish()
    }
}

// 安全性: チャンクはアリーナが単独所有し、`&self` 経由の割り当ては
// RefCell で直列化される。別スレッドへの移動は問題ない（Syncではない）。
unsafe impl Send for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_str_is_stable_and_terminated() {
        let arena = Arena::new();
        let s = arena.alloc_str("hello").unwrap();
        assert_eq!(s, "hello");

        // NUL終端を確認
        unsafe {
            let terminator = *s.as_ptr().add(s.len());
            assert_eq!(terminator, 0);
        }

        // 後続の割り当てで既存文字列のアドレスが動かないこと
        let addr = s.as_ptr();
        for i in 0..1000 {
            arena.alloc_str(&format!("filler-{}", i)).unwrap();
        }
        assert_eq!(addr, s.as_ptr());
        assert_eq!(s, "hello");
    }

    #[test]
    fn test_oversized_allocation_fails() {
        let arena = Arena::new();
        assert!(arena.alloc_raw(Arena::MAX_ALLOCATION_SIZE + 1, 8).is_none());
        assert!(arena.alloc_raw(0, 8).is_none());
        assert!(arena.alloc_raw(Arena::MAX_ALLOCATION_SIZE, 8).is_some());
    }

    #[test]
    fn test_new_chunk_on_overflow() {
        let arena = Arena::with_chunk_size(Arena::MIN_CHUNK_SIZE);
        let before = arena.stats().chunk_count;

        // 最小チャンクを確実に溢れさせる
        for _ in 0..8 {
            arena.alloc_raw(512, 8).unwrap();
        }

        assert!(arena.stats().chunk_count > before);
    }

    #[test]
    fn test_clear_rewinds_without_freeing() {
        let mut arena = Arena::with_chunk_size(Arena::MIN_CHUNK_SIZE);
        for _ in 0..8 {
            arena.alloc_raw(512, 8).unwrap();
        }
        let allocated = arena.total_allocated();
        let chunks = arena.stats().chunk_count;

        arena.clear();

        assert_eq!(arena.total_used(), 0);
        assert_eq!(arena.total_allocated(), allocated);
        assert_eq!(arena.stats().chunk_count, chunks);
    }

    #[test]
    fn test_reset_drops_chunks() {
        let mut arena = Arena::with_chunk_size(Arena::MIN_CHUNK_SIZE);
        for _ in 0..8 {
            arena.alloc_raw(512, 8).unwrap();
        }

        arena.reset();

        let stats = arena.stats();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.current_usage, 0);
        assert_eq!(stats.allocation_count, 0);
    }

    #[test]
    fn test_contains() {
        let arena = Arena::new();
        let s = arena.alloc_str("inside").unwrap();
        assert!(arena.contains(s.as_ptr()));

        let outside = String::from("outside");
        assert!(!arena.contains(outside.as_ptr()));
    }

    #[test]
    fn test_stats_accounting() {
        let arena = Arena::new();
        arena.alloc_raw(100, 8).unwrap();
        arena.alloc_raw(50, 8).unwrap();

        let stats = arena.stats();
        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.requested_bytes, 150);
        assert!(stats.current_usage >= 150);
        assert!(stats.peak_usage >= stats.current_usage);
    }
}
