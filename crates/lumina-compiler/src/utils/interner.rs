//! # 文字列インターナ
//!
//! バイト列を重複排除し、ポインタ同一性で比較できる安定ハンドル
//! [`InternedString`] を払い出します。同一インターナに同じ内容を
//! 渡せば常に同じハンドルが返り、ハンドルはインターナの
//! [`StringInterner::clear`] または破棄まで有効です。
//!
//! 並行性: 複数の読み取り（`lookup` / `contains`）と直列化された
//! 書き込み（`intern` の遅いパス）を `RwLock` で実現します。
//! 書き込みパスは排他ロック取得後にマップを再確認し、競合時の
//! 二重挿入を防ぎます。統計カウンタはアトミックに更新されます。

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use rustc_hash::FxHashMap;

use crate::utils::arena::Arena;

/// 空文字列ハンドルの指す固定NULバイト
static EMPTY_BYTES: [u8; 1] = [0];

/// インターン済み文字列のハンドル
///
/// 実体はインターナ所有の移動しないNUL終端バイト列への生ポインタで、
/// 等価・ハッシュ・順序はすべてポインタ値で決まります。
/// ヌルハンドルは「無効」を表します。
#[derive(Clone, Copy)]
pub struct InternedString {
    ptr: *const u8,
}

impl InternedString {
    /// 無効なハンドルを取得
    pub const fn invalid() -> Self {
        Self {
            ptr: std::ptr::null(),
        }
    }

    /// 固定の空文字列ハンドルを取得
    pub fn empty() -> Self {
        Self {
            ptr: EMPTY_BYTES.as_ptr(),
        }
    }

    pub(crate) fn from_ptr(ptr: *const u8) -> Self {
        Self { ptr }
    }

    /// ハンドルが有効かどうか
    pub fn is_valid(&self) -> bool {
        !self.ptr.is_null()
    }

    /// ヌル、または空文字列かどうか
    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || unsafe { *self.ptr == 0 }
    }

    /// 内部ポインタを取得（無効ハンドルはヌル）
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// NUL終端までのバイト列を取得。無効ハンドルは空スライス。
    pub fn as_bytes(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // 安全性: インターナはNUL終端を保証し、格納領域は移動も解放もされない
        unsafe {
            let mut len = 0usize;
            while *self.ptr.add(len) != 0 {
                len += 1;
            }
            std::slice::from_raw_parts(self.ptr, len)
        }
    }

    /// バイト数（NULを含まない）
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// UTF-8として解釈した文字列を取得（不正シーケンスは置換文字）
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    /// 内容がUTF-8であれば `&str` として取得
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }

    /// 内容比較（ポインタ比較より低速。通常はハンドル比較を使うこと）
    pub fn content_eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl Default for InternedString {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for InternedString {}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ptr as usize).cmp(&(other.ptr as usize))
    }
}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ptr as usize).hash(state);
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "InternedString({:?})", self.to_string_lossy())
        } else {
            write!(f, "InternedString(<invalid>)")
        }
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

// 安全性: ハンドルの指すバイト列は不変であり、所有インターナが
// 生存する限り解放されない。クリア後の使用はインターナ利用規約違反。
unsafe impl Send for InternedString {}
unsafe impl Sync for InternedString {}

/// インターナの統計情報
#[derive(Debug, Clone, Copy, Default)]
pub struct InternerStats {
    /// 新規インターン回数
    pub intern_count: usize,
    /// 検索（intern含む）回数
    pub lookup_count: usize,
    /// 競合時の再確認ヒット回数
    pub collision_count: usize,
    /// 格納バイト数（NUL終端を含む）
    pub bytes_stored: usize,
    /// 一意な文字列の数
    pub unique_strings: usize,
    /// 平均文字列長
    pub average_length: f64,
}

impl fmt::Display for InternerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StringInterner Statistics:")?;
        writeln!(f, "  Unique strings: {}", self.unique_strings)?;
        writeln!(f, "  Total lookups: {}", self.lookup_count)?;
        writeln!(f, "  Strings interned: {}", self.intern_count)?;
        writeln!(f, "  Hash collisions: {}", self.collision_count)?;
        writeln!(f, "  Memory used: {} bytes", self.bytes_stored)?;
        write!(f, "  Average string length: {:.1} chars", self.average_length)
    }
}

/// 内容格納先
enum Backing {
    /// 個別にBox化したNUL終端バッファ（Boxの中身はVecの再配置で動かない）
    Heap(Vec<Box<[u8]>>),
    /// アリーナ格納（アドレス安定はアリーナが保証）
    Arena(Arena),
}

struct InternerInner {
    /// 内容 → 格納済みバイト列（NULを除く全長キー）のマップ。
    /// キーは自前の安定格納領域を借用しており、エントリ解放は
    /// マップのクリアと同時にしか起きない。
    map: FxHashMap<&'static [u8], *const u8>,
    backing: Backing,
}

/// 文字列インターナ
pub struct StringInterner {
    inner: RwLock<InternerInner>,

    // 統計（アトミック更新。共有ロックしか持たないパスからも加算できる）
    intern_count: AtomicUsize,
    lookup_count: AtomicUsize,
    collision_count: AtomicUsize,
    bytes_stored: AtomicUsize,
    unique_strings: AtomicUsize,
    total_length: AtomicUsize,
}

impl StringInterner {
    /// ヒープ格納のインターナを作成
    pub fn new() -> Self {
        Self::with_backing(Backing::Heap(Vec::new()))
    }

    /// アリーナ格納のインターナを作成。アリーナは占有所有される。
    pub fn with_arena(arena: Arena) -> Self {
        Self::with_backing(Backing::Arena(arena))
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            inner: RwLock::new(InternerInner {
                map: FxHashMap::default(),
                backing,
            }),
            intern_count: AtomicUsize::new(0),
            lookup_count: AtomicUsize::new(0),
            collision_count: AtomicUsize::new(0),
            bytes_stored: AtomicUsize::new(0),
            unique_strings: AtomicUsize::new(0),
            total_length: AtomicUsize::new(0),
        }
    }

    /// バイト列をインターンしてハンドルを返す
    ///
    /// 同一内容には常に同一ハンドルが返る。空入力は固定の空ハンドル。
    pub fn intern(&self, bytes: &[u8]) -> InternedString {
        self.lookup_count.fetch_add(1, Ordering::Relaxed);

        if bytes.is_empty() {
            return InternedString::empty();
        }

        // 速いパス: 共有ロックで既存エントリを探す
        {
            let inner = self.inner.read().expect("interner lock poisoned");
            if let Some(&ptr) = inner.map.get(bytes) {
                return InternedString::from_ptr(ptr);
            }
        }

        // 遅いパス: 排他ロックを取り、待機中に他スレッドが
        // 挿入していないか再確認してから格納する
        let mut inner = self.inner.write().expect("interner lock poisoned");
        if let Some(&ptr) = inner.map.get(bytes) {
            self.collision_count.fetch_add(1, Ordering::Relaxed);
            return InternedString::from_ptr(ptr);
        }

        // 負荷率75%超で容量を倍増しておく
        if inner.map.len() + 1 > inner.map.capacity() * 3 / 4 {
            let target = (inner.map.capacity() * 2).max(16);
            let additional = target - inner.map.len();
            inner.map.reserve(additional);
        }

        let ptr = match &mut inner.backing {
            Backing::Heap(storage) => {
                let mut buf = Vec::with_capacity(bytes.len() + 1);
                buf.extend_from_slice(bytes);
                buf.push(0);
                let boxed: Box<[u8]> = buf.into_boxed_slice();
                let ptr = boxed.as_ptr();
                storage.push(boxed);
                ptr
            }
            Backing::Arena(arena) => arena
                .alloc_terminated(bytes)
                .expect("arena allocation failed for interned string")
                .as_ptr() as *const u8,
        };

        // 安全性: ptr の指す領域は clear()/drop までは移動も解放もされず、
        // マップはその時点で同時にクリアされるため 'static 扱いにできる
        let stored: &'static [u8] =
            unsafe { std::slice::from_raw_parts(ptr, bytes.len()) };
        inner.map.insert(stored, ptr);

        self.intern_count.fetch_add(1, Ordering::Relaxed);
        self.unique_strings.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes.len() + 1, Ordering::Relaxed);
        self.total_length.fetch_add(bytes.len(), Ordering::Relaxed);

        InternedString::from_ptr(ptr)
    }

    /// 文字列をインターンする
    pub fn intern_str(&self, s: &str) -> InternedString {
        self.intern(s.as_bytes())
    }

    /// 既にインターン済みであればハンドルを返す。なければ無効ハンドル。
    pub fn lookup(&self, bytes: &[u8]) -> InternedString {
        let inner = self.inner.read().expect("interner lock poisoned");
        match inner.map.get(bytes) {
            Some(&ptr) => InternedString::from_ptr(ptr),
            None => InternedString::invalid(),
        }
    }

    /// 指定内容がインターン済みかどうか
    pub fn contains(&self, bytes: &[u8]) -> bool {
        let inner = self.inner.read().expect("interner lock poisoned");
        inner.map.contains_key(bytes)
    }

    /// 一意な文字列の数
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("interner lock poisoned");
        inner.map.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 指定数ぶんの容量を予約
    pub fn reserve(&self, count: usize) {
        let mut inner = self.inner.write().expect("interner lock poisoned");
        inner.map.reserve(count);
        if let Backing::Heap(storage) = &mut inner.backing {
            storage.reserve(count);
        }
    }

    /// 全エントリを破棄する。既存ハンドルはすべて無効になる。
    pub fn clear(&mut self) {
        let inner = self.inner.get_mut().expect("interner lock poisoned");
        inner.map.clear();
        match &mut inner.backing {
            Backing::Heap(storage) => storage.clear(),
            Backing::Arena(arena) => arena.reset(),
        }

        self.intern_count.store(0, Ordering::Relaxed);
        self.lookup_count.store(0, Ordering::Relaxed);
        self.collision_count.store(0, Ordering::Relaxed);
        self.bytes_stored.store(0, Ordering::Relaxed);
        self.unique_strings.store(0, Ordering::Relaxed);
        self.total_length.store(0, Ordering::Relaxed);
    }

    /// アリーナ格納かどうか
    pub fn uses_arena(&self) -> bool {
        let inner = self.inner.read().expect("interner lock poisoned");
        matches!(inner.backing, Backing::Arena(_))
    }

    /// 統計情報のスナップショットを取得
    pub fn stats(&self) -> InternerStats {
        let unique = self.unique_strings.load(Ordering::Relaxed);
        let total = self.total_length.load(Ordering::Relaxed);
        InternerStats {
            intern_count: self.intern_count.load(Ordering::Relaxed),
            lookup_count: self.lookup_count.load(Ordering::Relaxed),
            collision_count: self.collision_count.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            unique_strings: unique,
            average_length: if unique > 0 {
                total as f64 / unique as f64
            } else {
                0.0
            },
        }
    }

    /// 概算メモリ使用量（格納バイト + マップのオーバーヘッド）
    pub fn memory_usage(&self) -> usize {
        let inner = self.inner.read().expect("interner lock poisoned");
        let map_overhead = inner.map.capacity()
            * (std::mem::size_of::<&[u8]>() + std::mem::size_of::<*const u8>());
        self.bytes_stored.load(Ordering::Relaxed) + map_overhead
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StringInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringInterner")
            .field("unique_strings", &self.unique_strings.load(Ordering::Relaxed))
            .field("uses_arena", &self.uses_arena())
            .finish()
    }
}

// 安全性: マップのキーは自前の安定領域を指し、変更操作はすべて
// RwLock で直列化される。格納バイト列は挿入後不変。
unsafe impl Send for StringInterner {}
unsafe impl Sync for StringInterner {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_same_content_same_handle() {
        let interner = StringInterner::new();
        let a = interner.intern_str("hello");
        let b = interner.intern_str("hello");
        let c = interner.intern_str("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.as_bytes(), b"hello");
    }

    #[test]
    fn test_handle_stability_across_growth() {
        let interner = StringInterner::new();
        let first = interner.intern_str("anchor");
        let ptr = first.as_ptr();

        for i in 0..10_000 {
            interner.intern_str(&format!("filler-{}", i));
        }

        let again = interner.intern_str("anchor");
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again, first);
    }

    #[test]
    fn test_empty_input_returns_fixed_handle() {
        let interner = StringInterner::new();
        let a = interner.intern(b"");
        let b = interner.intern(b"");
        assert_eq!(a, b);
        assert!(a.is_empty());
        assert!(a.is_valid());
    }

    #[test]
    fn test_lookup_and_contains() {
        let interner = StringInterner::new();
        assert!(!interner.contains(b"key"));
        assert!(!interner.lookup(b"key").is_valid());

        let handle = interner.intern(b"key");
        assert!(interner.contains(b"key"));
        assert_eq!(interner.lookup(b"key"), handle);
    }

    #[test]
    fn test_arena_backing() {
        let interner = StringInterner::with_arena(Arena::new());
        assert!(interner.uses_arena());

        let a = interner.intern_str("arena-backed");
        let b = interner.intern_str("arena-backed");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b"arena-backed");
    }

    #[test]
    fn test_clear_invalidates_and_resets() {
        let mut interner = StringInterner::new();
        interner.intern_str("gone");
        assert_eq!(interner.len(), 1);

        interner.clear();
        assert_eq!(interner.len(), 0);
        assert!(!interner.contains(b"gone"));
        assert_eq!(interner.stats().unique_strings, 0);
    }

    #[test]
    fn test_stats_average_length() {
        let interner = StringInterner::new();
        interner.intern(b"ab");
        interner.intern(b"abcd");

        let stats = interner.stats();
        assert_eq!(stats.unique_strings, 2);
        assert_eq!(stats.intern_count, 2);
        assert!((stats.average_length - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_intern_single_entry() {
        use std::sync::Arc;
        use std::thread;

        let interner = Arc::new(StringInterner::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let interner = Arc::clone(&interner);
            handles.push(thread::spawn(move || {
                let mut ptrs = Vec::new();
                for i in 0..100 {
                    ptrs.push(interner.intern_str(&format!("shared-{}", i % 10)).as_ptr() as usize);
                }
                ptrs
            }));
        }

        let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // どのスレッドから見ても同じ内容は同じポインタ
        for i in 0..10 {
            let expected = interner.intern_str(&format!("shared-{}", i)).as_ptr() as usize;
            for ptrs in &results {
                assert!(ptrs.contains(&expected));
            }
        }
        assert_eq!(interner.len(), 10);
    }
}
