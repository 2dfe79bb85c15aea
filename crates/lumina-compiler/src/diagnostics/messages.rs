//! # 診断メッセージ定義
//!
//! 診断の種別ID（[`DiagnosticId`]）と、IDごとの静的情報
//! （[`DiagnosticInfo`]）を定義します。テーブルはコンパイル時に
//! 凍結され、リリース内でIDの数値と順序は安定です。
//!
//! 詳細メッセージには `%0`, `%1`, … のプレースホルダを使用でき、
//! 報告時に [`Diagnostic`](crate::diagnostics::Diagnostic) の引数で
//! 置換されます。

use serde::{Deserialize, Serialize};

/// 診断の重大度レベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    /// 注記
    Note,
    /// 警告
    Warning,
    /// エラー
    Error,
    /// 致命的エラー（以降のコンパイルを中止させる）
    Fatal,
}

impl DiagnosticLevel {
    /// 人間向け出力でのレベル名
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticLevel::Note => "note",
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Fatal => "fatal error",
        }
    }

    /// JSON出力でのレベル名
    pub fn json_str(&self) -> &'static str {
        match self {
            DiagnosticLevel::Note => "note",
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 診断の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// ファイルI/O、メモリなどのシステム起因
    System,
    /// 字句解析
    Lexical,
    /// 構文解析
    Syntax,
    /// 意味解析
    Semantic,
    /// 型システム
    Type,
    /// コード生成
    Codegen,
    /// リンク
    Link,
    /// 実行時
    Runtime,
}

/// 診断種別ごとの静的情報
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticInfo {
    /// 重大度レベル
    pub level: DiagnosticLevel,
    /// 分類
    pub kind: DiagnosticKind,
    /// 短いメッセージ
    pub short_message: &'static str,
    /// 詳細メッセージ（`%N` プレースホルダ付き）
    pub detailed_message: &'static str,
}

impl DiagnosticInfo {
    const fn new(
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        short_message: &'static str,
        detailed_message: &'static str,
    ) -> Self {
        Self {
            level,
            kind,
            short_message,
            detailed_message,
        }
    }
}

/// 診断種別の一意識別子
///
/// 数値と順序は [`DIAGNOSTIC_INFOS`] の並びに一致します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DiagnosticId {
    // ----- エラー -----
    /// 文字列リテラルが終端していない
    UnterminatedStringLiteral,
    /// 文字リテラルが終端していない
    UnterminatedCharacterLiteral,
    /// 予期しない値（不明なバイトなど）
    UnexpectedValue,
    /// ソースファイルを開けない
    CannotOpenFile,

    // ----- 致命的エラー -----
    /// コンパイラ内部の不変条件違反
    InternalCompilerError,
    /// ソースが位置空間に収まらない
    SourceFileTooLarge,

    // ----- 警告 -----
    /// ブロックコメントが終端せずEOFに到達した
    UnterminatedBlockComment,
    /// 認識できないエスケープシーケンス
    UnknownEscapeSequence,

    // ----- 注記 -----
    /// 関連する以前の出現位置
    PreviousOccurrence,
}

impl DiagnosticId {
    /// 定義済み診断種別の総数
    pub const COUNT: u32 = 9;

    /// 生の数値からIDを復元する
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw < Self::COUNT {
            // 安全性: reprはu32で、rawは定義済み範囲内
            Some(unsafe { std::mem::transmute::<u32, DiagnosticId>(raw) })
        } else {
            None
        }
    }

    /// IDの生の数値
    pub fn raw(&self) -> u32 {
        *self as u32
    }

    /// この診断種別の静的情報を取得
    pub fn info(&self) -> &'static DiagnosticInfo {
        &DIAGNOSTIC_INFOS[*self as usize]
    }
}

/// 全診断種別の静的情報テーブル（[`DiagnosticId`] と同順）
pub static DIAGNOSTIC_INFOS: [DiagnosticInfo; DiagnosticId::COUNT as usize] = [
    // エラー
    DiagnosticInfo::new(
        DiagnosticLevel::Error,
        DiagnosticKind::Lexical,
        "文字列リテラルが終端していません",
        "文字列リテラルが終端していません。閉じ引用符 '\"' が必要です",
    ),
    DiagnosticInfo::new(
        DiagnosticLevel::Error,
        DiagnosticKind::Lexical,
        "文字リテラルが終端していません",
        "文字リテラルが終端していません。閉じ引用符 \"'\" が必要です",
    ),
    DiagnosticInfo::new(
        DiagnosticLevel::Error,
        DiagnosticKind::Lexical,
        "予期しない値です",
        "%0 を期待しましたが、%1 が見つかりました",
    ),
    DiagnosticInfo::new(
        DiagnosticLevel::Error,
        DiagnosticKind::System,
        "ファイルを開けません",
        "ソースファイル '%0' を開けません: %1",
    ),
    // 致命的エラー
    DiagnosticInfo::new(
        DiagnosticLevel::Fatal,
        DiagnosticKind::System,
        "内部コンパイラエラー",
        "内部コンパイラエラー: %0",
    ),
    DiagnosticInfo::new(
        DiagnosticLevel::Fatal,
        DiagnosticKind::System,
        "ソースファイルが大きすぎます",
        "ソースファイル '%0' はグローバル位置空間に収まりません",
    ),
    // 警告
    DiagnosticInfo::new(
        DiagnosticLevel::Warning,
        DiagnosticKind::Lexical,
        "ブロックコメントが終端していません",
        "ブロックコメントが終端しないままファイル終端に到達しました。'*/' が必要です",
    ),
    DiagnosticInfo::new(
        DiagnosticLevel::Warning,
        DiagnosticKind::Lexical,
        "認識できないエスケープシーケンスです",
        "認識できないエスケープシーケンス '\\%0' です。文字そのものとして扱います",
    ),
    // 注記
    DiagnosticInfo::new(
        DiagnosticLevel::Note,
        DiagnosticKind::Semantic,
        "以前の出現はここです",
        "以前の出現はここです",
    ),
];

/// 不正なIDに対して返す捕捉用の情報
pub static INVALID_DIAGNOSTIC_INFO: DiagnosticInfo = DiagnosticInfo::new(
    DiagnosticLevel::Error,
    DiagnosticKind::System,
    "不正な診断IDです",
    "不正な診断IDが使用されました",
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_enum_order() {
        assert_eq!(
            DIAGNOSTIC_INFOS.len(),
            DiagnosticId::COUNT as usize
        );
        assert_eq!(
            DiagnosticId::UnterminatedStringLiteral.info().level,
            DiagnosticLevel::Error
        );
        assert_eq!(
            DiagnosticId::UnterminatedBlockComment.info().level,
            DiagnosticLevel::Warning
        );
        assert_eq!(
            DiagnosticId::InternalCompilerError.info().level,
            DiagnosticLevel::Fatal
        );
        assert_eq!(
            DiagnosticId::PreviousOccurrence.info().level,
            DiagnosticLevel::Note
        );
    }

    #[test]
    fn test_from_raw_round_trip() {
        for raw in 0..DiagnosticId::COUNT {
            let id = DiagnosticId::from_raw(raw).unwrap();
            assert_eq!(id.raw(), raw);
        }
        assert!(DiagnosticId::from_raw(DiagnosticId::COUNT).is_none());
    }

    #[test]
    fn test_level_names() {
        assert_eq!(DiagnosticLevel::Fatal.as_str(), "fatal error");
        assert_eq!(DiagnosticLevel::Fatal.json_str(), "fatal");
        assert_eq!(DiagnosticLevel::Note.as_str(), "note");
    }
}
