//! # ユーティリティモジュール
//!
//! コンパイラ全体で利用される基盤部品を提供します。
//! アリーナアロケータと文字列インターナはフロントエンドの
//! メモリ戦略の中核であり、後段のすべてのフェーズが依存します。

pub mod arena;
pub mod interner;

pub use arena::{Arena, ArenaStats};
pub use interner::{InternedString, InternerStats, StringInterner};
