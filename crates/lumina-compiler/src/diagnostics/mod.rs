//! # 診断マネージャ
//!
//! コンパイル中に発生した問題の中央集約先です。フィルタリング
//! （警告・注記の抑制、警告のエラー昇格、エラー数上限）、単調増加の
//! レベル別カウンタ、登録順のコンシューマへの配送を担います。
//!
//! エラーと致命的エラーは決して抑制されません。致命的エラーの発生、
//! またはエラー数上限への到達後は [`DiagnosticManager::should_continue`]
//! が `false` を返し、ドライバは次のフェーズへ進まないことが
//! 期待されます。

pub mod consumer;
pub mod messages;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::source::location::{SourceLocation, SourceRange};
use crate::source::source_manager::SourceManager;

pub use consumer::{DiagnosticConsumer, JsonDiagnosticConsumer, TextDiagnosticConsumer};
pub use messages::{
    DiagnosticId, DiagnosticInfo, DiagnosticKind, DiagnosticLevel, DIAGNOSTIC_INFOS,
    INVALID_DIAGNOSTIC_INFO,
};

/// 修正提案（フィックスイット）
///
/// 範囲と置換テキストの組からなるデータであり、適用はドライバの責務。
#[derive(Debug, Clone)]
pub struct FixItHint {
    /// 置換対象の範囲
    pub range: SourceRange,
    /// 置換テキスト
    pub replacement: String,
}

/// 1件の診断
///
/// 種別ID・位置・メッセージ引数・強調範囲・修正提案を持ちます。
#[derive(Debug, Clone)]
pub struct Diagnostic {
    id: DiagnosticId,
    location: SourceLocation,
    args: Vec<String>,
    ranges: Vec<SourceRange>,
    fixits: Vec<FixItHint>,
}

impl Diagnostic {
    /// 新しい診断を作成
    pub fn new(id: DiagnosticId, location: SourceLocation) -> Self {
        Self {
            id,
            location,
            args: Vec::new(),
            ranges: Vec::new(),
            fixits: Vec::new(),
        }
    }

    /// メッセージ引数を追加（`%0`, `%1`, … に順に束縛される）
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// 強調範囲を追加
    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.ranges.push(range);
        self
    }

    /// 修正提案を追加
    pub fn with_fixit(mut self, range: SourceRange, replacement: impl Into<String>) -> Self {
        self.fixits.push(FixItHint {
            range,
            replacement: replacement.into(),
        });
        self
    }

    /// 種別IDを取得
    pub fn id(&self) -> DiagnosticId {
        self.id
    }

    /// 位置を取得
    pub fn location(&self) -> SourceLocation {
        self.location
    }

    /// メッセージ引数を取得
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// 強調範囲を取得
    pub fn ranges(&self) -> &[SourceRange] {
        &self.ranges
    }

    /// 修正提案を取得
    pub fn fixits(&self) -> &[FixItHint] {
        &self.fixits
    }
}

/// 診断の統計情報。カウンタは `reset()` を除き単調増加。
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticStats {
    /// 注記の数
    pub note_count: usize,
    /// 警告の数
    pub warning_count: usize,
    /// エラーの数
    pub error_count: usize,
    /// 致命的エラーの数
    pub fatal_count: usize,
    /// 診断の総数
    pub diagnostic_count: usize,
}

impl DiagnosticStats {
    /// エラー（致命的エラー含む）があるか
    pub fn has_errors(&self) -> bool {
        self.error_count > 0 || self.fatal_count > 0
    }

    /// 警告があるか
    pub fn has_warnings(&self) -> bool {
        self.warning_count > 0
    }
}

impl std::fmt::Display for DiagnosticStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Diagnostic Statistics:")?;
        writeln!(f, "  Notes: {}", self.note_count)?;
        writeln!(f, "  Warnings: {}", self.warning_count)?;
        writeln!(f, "  Errors: {}", self.error_count)?;
        writeln!(f, "  Fatal errors: {}", self.fatal_count)?;
        write!(f, "  Total: {}", self.diagnostic_count)
    }
}

/// `%0`, `%1`, … を引数で置換する
pub(crate) fn format_message(template: &str, args: &[String]) -> String {
    let mut result = template.to_string();
    for (i, arg) in args.iter().enumerate() {
        let placeholder = format!("%{}", i);
        result = result.replace(&placeholder, arg);
    }
    result
}

/// 診断マネージャ
pub struct DiagnosticManager {
    /// 位置解決に使うソースマネージャ（任意）
    source_manager: Mutex<Option<Arc<SourceManager>>>,
    /// 登録済みコンシューマ（登録順に配送）
    consumers: Mutex<Vec<Box<dyn DiagnosticConsumer>>>,

    // フィルタ設定
    suppress_warnings: AtomicBool,
    suppress_notes: AtomicBool,
    warnings_as_errors: AtomicBool,
    /// エラー数の上限。0は無制限。
    max_errors: AtomicUsize,

    /// 統計（短いロックの下で更新）
    stats: Mutex<DiagnosticStats>,
}

impl DiagnosticManager {
    /// 新しい診断マネージャを作成
    pub fn new() -> Self {
        Self {
            source_manager: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
            suppress_warnings: AtomicBool::new(false),
            suppress_notes: AtomicBool::new(false),
            warnings_as_errors: AtomicBool::new(false),
            max_errors: AtomicUsize::new(0),
            stats: Mutex::new(DiagnosticStats::default()),
        }
    }

    /// 位置情報の解決に使うソースマネージャを設定
    pub fn set_source_manager(&self, source_manager: Arc<SourceManager>) {
        *self.source_manager.lock().unwrap() = Some(source_manager);
    }

    /// コンシューマを追加する。配送は登録順。
    pub fn add_consumer(&self, consumer: Box<dyn DiagnosticConsumer>) {
        self.consumers.lock().unwrap().push(consumer);
    }

    /// 全コンシューマを除去
    pub fn clear_consumers(&self) {
        self.consumers.lock().unwrap().clear();
    }

    /// 診断を報告する
    pub fn report(&self, diag: Diagnostic) {
        let info = Self::diagnostic_info(diag.id());

        // 抑制判定は元のレベルで行う
        if self.should_suppress(info.level) {
            return;
        }

        // 設定により警告をエラーへ昇格する
        let mut effective = *info;
        if self.warnings_as_errors.load(Ordering::Relaxed)
            && info.level == DiagnosticLevel::Warning
        {
            effective.level = DiagnosticLevel::Error;
        }

        // カウンタ更新は短いロックの下で行う
        let suppressed_by_cap = {
            let mut stats = self.stats.lock().unwrap();
            match effective.level {
                DiagnosticLevel::Note => stats.note_count += 1,
                DiagnosticLevel::Warning => stats.warning_count += 1,
                DiagnosticLevel::Error => stats.error_count += 1,
                DiagnosticLevel::Fatal => stats.fatal_count += 1,
            }
            stats.diagnostic_count += 1;

            let max_errors = self.max_errors.load(Ordering::Relaxed);
            max_errors > 0 && stats.error_count >= max_errors
        };

        // 上限到達後はカウントのみ継続し、配送は止める
        if suppressed_by_cap {
            warn!("error limit reached; suppressing further diagnostics");
            return;
        }

        // ロックの外（統計ロック）でコンシューマへ配送する
        let source_manager = self.source_manager.lock().unwrap().clone();
        let mut consumers = self.consumers.lock().unwrap();
        for consumer in consumers.iter_mut() {
            consumer.handle_diagnostic(&diag, &effective, source_manager.as_deref());
        }
    }

    /// 引数なしの診断を報告する
    pub fn report_id(&self, id: DiagnosticId, location: SourceLocation) {
        self.report(Diagnostic::new(id, location));
    }

    /// 引数1つの診断を報告する
    pub fn report_with_arg(
        &self,
        id: DiagnosticId,
        location: SourceLocation,
        arg: impl Into<String>,
    ) {
        self.report(Diagnostic::new(id, location).with_arg(arg));
    }

    /// 引数2つの診断を報告する
    pub fn report_with_args(
        &self,
        id: DiagnosticId,
        location: SourceLocation,
        arg1: impl Into<String>,
        arg2: impl Into<String>,
    ) {
        self.report(Diagnostic::new(id, location).with_arg(arg1).with_arg(arg2));
    }

    /// 全コンシューマの `begin_source_file` を呼ぶ
    pub fn begin_source_file(&self) {
        for consumer in self.consumers.lock().unwrap().iter_mut() {
            consumer.begin_source_file();
        }
    }

    /// 全コンシューマの `end_source_file` を呼ぶ
    pub fn end_source_file(&self) {
        for consumer in self.consumers.lock().unwrap().iter_mut() {
            consumer.end_source_file();
        }
    }

    /// 全コンシューマの `finish` を呼ぶ
    pub fn finish(&self) {
        for consumer in self.consumers.lock().unwrap().iter_mut() {
            consumer.finish();
        }
    }

    /// 警告を抑制するかどうかを設定
    pub fn set_suppress_warnings(&self, suppress: bool) {
        self.suppress_warnings.store(suppress, Ordering::Relaxed);
    }

    /// 注記を抑制するかどうかを設定
    pub fn set_suppress_notes(&self, suppress: bool) {
        self.suppress_notes.store(suppress, Ordering::Relaxed);
    }

    /// 警告をエラーとして扱うかどうかを設定
    pub fn set_warnings_as_errors(&self, enable: bool) {
        self.warnings_as_errors.store(enable, Ordering::Relaxed);
    }

    /// エラー数の上限を設定（0は無制限）
    pub fn set_max_errors(&self, max: usize) {
        self.max_errors.store(max, Ordering::Relaxed);
    }

    /// 警告を抑制するかどうか
    pub fn suppress_warnings(&self) -> bool {
        self.suppress_warnings.load(Ordering::Relaxed)
    }

    /// 注記を抑制するかどうか
    pub fn suppress_notes(&self) -> bool {
        self.suppress_notes.load(Ordering::Relaxed)
    }

    /// 警告をエラーとして扱うかどうか
    pub fn warnings_as_errors(&self) -> bool {
        self.warnings_as_errors.load(Ordering::Relaxed)
    }

    /// エラー数の上限
    pub fn max_errors(&self) -> usize {
        self.max_errors.load(Ordering::Relaxed)
    }

    /// 統計情報を取得
    pub fn stats(&self) -> DiagnosticStats {
        *self.stats.lock().unwrap()
    }

    /// エラー（致命的エラー含む）が発生しているか
    pub fn has_errors(&self) -> bool {
        self.stats().has_errors()
    }

    /// 警告が発生しているか
    pub fn has_warnings(&self) -> bool {
        self.stats().has_warnings()
    }

    /// 致命的エラーが発生しているか
    pub fn has_fatal_errors(&self) -> bool {
        self.stats().fatal_count > 0
    }

    /// 統計カウンタをリセットする
    pub fn reset(&self) {
        *self.stats.lock().unwrap() = DiagnosticStats::default();
    }

    /// IDから静的情報を取得する。未定義IDには捕捉用の情報を返す。
    pub fn diagnostic_info(id: DiagnosticId) -> &'static DiagnosticInfo {
        match DiagnosticId::from_raw(id.raw()) {
            Some(valid) => valid.info(),
            None => &INVALID_DIAGNOSTIC_INFO,
        }
    }

    /// コンパイルを継続すべきかどうか。
    /// 致命的エラー発生後、またはエラー数上限到達後は `false`。
    pub fn should_continue(&self) -> bool {
        let stats = self.stats.lock().unwrap();
        if stats.fatal_count > 0 {
            return false;
        }
        let max_errors = self.max_errors.load(Ordering::Relaxed);
        !(max_errors > 0 && stats.error_count >= max_errors)
    }

    fn should_suppress(&self, level: DiagnosticLevel) -> bool {
        match level {
            DiagnosticLevel::Note => self.suppress_notes.load(Ordering::Relaxed),
            DiagnosticLevel::Warning => self.suppress_warnings.load(Ordering::Relaxed),
            // エラーと致命的エラーは決して抑制しない
            DiagnosticLevel::Error | DiagnosticLevel::Fatal => false,
        }
    }
}

impl Default for DiagnosticManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiagnosticManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticManager")
            .field("stats", &self.stats())
            .field("max_errors", &self.max_errors())
            .finish()
    }
}

/// スコープ内で警告と注記を抑制するRAIIガード
///
/// 生成時に抑制を有効化し、ドロップ時に元の設定へ戻します。
/// 一括処理中のノイズ抑制に使います。
pub struct DiagnosticSuppressor<'a> {
    manager: &'a DiagnosticManager,
    old_suppress_warnings: bool,
    old_suppress_notes: bool,
}

impl<'a> DiagnosticSuppressor<'a> {
    /// 抑制を開始する
    pub fn new(manager: &'a DiagnosticManager) -> Self {
        let old_suppress_warnings = manager.suppress_warnings();
        let old_suppress_notes = manager.suppress_notes();
        manager.set_suppress_warnings(true);
        manager.set_suppress_notes(true);
        Self {
            manager,
            old_suppress_warnings,
            old_suppress_notes,
        }
    }
}

impl Drop for DiagnosticSuppressor<'_> {
    fn drop(&mut self) {
        self.manager
            .set_suppress_warnings(self.old_suppress_warnings);
        self.manager.set_suppress_notes(self.old_suppress_notes);
    }
}
