// Lumina Compiler Frontend Library
// 言語コンパイラのフロントエンド基盤ライブラリ

//! # Lumina Compiler Frontend
//!
//! Lumina言語コンパイラのフロントエンド基盤ライブラリです。
//! ファイルパスから分類済みトークン列と正確なソース位置情報を生成し、
//! その過程で発生した構造化診断を収集・整形するためのサブシステム群を
//! 提供します。
//!
//! 構成要素（依存順）:
//!
//! - [`utils::arena`] — 短命な多数オブジェクト向けのバンプアロケータ
//! - [`utils::interner`] — ポインタ同一性を持つ文字列インターナ
//! - [`source::file_manager`] — ファイルの読み込み・正規化・キャッシュ
//! - [`source::source_manager`] — 32bitグローバル位置空間と行・列の解決
//! - [`diagnostics`] — 診断マネージャと Text/JSON コンシューマ
//! - [`frontend::lexer`] — C系言語向けの字句解析器
//!
//! パーサ・型検査器・コード生成・ドライバCLIは本クレートの範囲外であり、
//! ここで定義されるインターフェースを利用する外部協調者として扱われます。

// 内部モジュールの宣言
pub mod diagnostics;
pub mod frontend;
pub mod source;
pub mod utils;

// 再エクスポート
pub use self::diagnostics::{
    Diagnostic, DiagnosticConsumer, DiagnosticId, DiagnosticInfo, DiagnosticKind,
    DiagnosticLevel, DiagnosticManager, DiagnosticStats, DiagnosticSuppressor,
    JsonDiagnosticConsumer, TextDiagnosticConsumer,
};
pub use self::frontend::lexer::token::{Token, TokenFlags, TokenKind};
pub use self::frontend::lexer::{Lexer, LexerOptions, LexerStats};
pub use self::source::file_manager::{FileEntry, FileError, FileManager};
pub use self::source::location::{FileId, FullSourceLoc, SourceLocation, SourceRange};
pub use self::source::source_manager::SourceManager;
pub use self::utils::arena::Arena;
pub use self::utils::interner::{InternedString, StringInterner};

/// コンパイラのバージョン
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
