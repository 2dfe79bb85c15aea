//! # レキサー（字句解析器）
//!
//! ソースコードのバイト列を分類し、位置情報付きのトークン列へ
//! 変換するモジュールです。入力は `SourceManager` 管理下のファイル
//! （位置解決あり）か、生のバイトスライス（位置は無効）のどちらかです。
//!
//! 字句エラーで停止することはありません。問題は
//! [`DiagnosticManager`] を通じて報告され、該当区間にも必ず
//! トークン（場合によっては `Unknown`）が生成されるため、利用側は
//! 常に完全なトークン列を受け取ります。

use std::time::{Duration, Instant};

use crate::diagnostics::{DiagnosticId, DiagnosticManager};
use crate::source::location::{FileId, SourceLocation};
use crate::source::source_manager::SourceManager;
use crate::utils::interner::StringInterner;

pub mod buffer;
pub mod token;

use self::token::{Token, TokenFlags, TokenKind};

pub use buffer::{BatchTokenizer, TokenBuffer, TokenStream};

// 文字クラステーブルのビットフラグ
const CLASS_ALPHA: u8 = 1;
const CLASS_DIGIT: u8 = 2;
const CLASS_WHITESPACE: u8 = 4;
const CLASS_NEWLINE: u8 = 8;
const CLASS_HEX: u8 = 16;

/// 256要素の文字クラステーブルを構築する（コンパイル時定数）
const fn build_char_class_table() -> [u8; 256] {
    let mut table = [0u8; 256];

    let mut c = b'a';
    while c <= b'z' {
        table[c as usize] = CLASS_ALPHA | if c <= b'f' { CLASS_HEX } else { 0 };
        c += 1;
    }
    let mut c = b'A';
    while c <= b'Z' {
        table[c as usize] = CLASS_ALPHA | if c <= b'F' { CLASS_HEX } else { 0 };
        c += 1;
    }
    let mut c = b'0';
    while c <= b'9' {
        table[c as usize] = CLASS_DIGIT | CLASS_HEX;
        c += 1;
    }

    table[b' ' as usize] = CLASS_WHITESPACE;
    table[b'\t' as usize] = CLASS_WHITESPACE;
    table[0x0B] = CLASS_WHITESPACE; // VT
    table[0x0C] = CLASS_WHITESPACE; // FF

    table[b'\n' as usize] = CLASS_NEWLINE;
    table[b'\r' as usize] = CLASS_NEWLINE;

    // アンダースコアは識別子の先頭・途中に使える
    table[b'_' as usize] = CLASS_ALPHA;

    table
}

static CHAR_CLASS_TABLE: [u8; 256] = build_char_class_table();

#[inline]
fn is_alpha(c: u8) -> bool {
    CHAR_CLASS_TABLE[c as usize] & CLASS_ALPHA != 0
}

#[inline]
fn is_digit(c: u8) -> bool {
    CHAR_CLASS_TABLE[c as usize] & CLASS_DIGIT != 0
}

#[inline]
fn is_alnum(c: u8) -> bool {
    CHAR_CLASS_TABLE[c as usize] & (CLASS_ALPHA | CLASS_DIGIT) != 0
}

#[inline]
fn is_hex_digit(c: u8) -> bool {
    CHAR_CLASS_TABLE[c as usize] & CLASS_HEX != 0
}

#[inline]
fn is_whitespace(c: u8) -> bool {
    CHAR_CLASS_TABLE[c as usize] & CLASS_WHITESPACE != 0
}

#[inline]
fn is_newline(c: u8) -> bool {
    CHAR_CLASS_TABLE[c as usize] & CLASS_NEWLINE != 0
}

#[inline]
fn is_octal_digit(c: u8) -> bool {
    (b'0'..=b'7').contains(&c)
}

/// 1バイト演算子・区切り記号のディスパッチテーブル
const fn build_single_char_table() -> [TokenKind; 128] {
    let mut table = [TokenKind::Unknown; 128];

    table[b'+' as usize] = TokenKind::Plus;
    table[b'-' as usize] = TokenKind::Minus;
    table[b'*' as usize] = TokenKind::Star;
    table[b'/' as usize] = TokenKind::Slash;
    table[b'%' as usize] = TokenKind::Percent;
    table[b'=' as usize] = TokenKind::Equal;
    table[b'!' as usize] = TokenKind::Exclaim;
    table[b'<' as usize] = TokenKind::Less;
    table[b'>' as usize] = TokenKind::Greater;
    table[b'&' as usize] = TokenKind::Amp;
    table[b'|' as usize] = TokenKind::Pipe;
    table[b'^' as usize] = TokenKind::Caret;
    table[b'~' as usize] = TokenKind::Tilde;
    table[b'(' as usize] = TokenKind::LeftParen;
    table[b')' as usize] = TokenKind::RightParen;
    table[b'{' as usize] = TokenKind::LeftBrace;
    table[b'}' as usize] = TokenKind::RightBrace;
    table[b'[' as usize] = TokenKind::LeftBracket;
    table[b']' as usize] = TokenKind::RightBracket;
    table[b';' as usize] = TokenKind::Semicolon;
    table[b',' as usize] = TokenKind::Comma;
    table[b'.' as usize] = TokenKind::Dot;
    table[b':' as usize] = TokenKind::Colon;
    table[b'?' as usize] = TokenKind::Question;
    table[b'@' as usize] = TokenKind::At;
    table[b'#' as usize] = TokenKind::Hash;
    table[b'\\' as usize] = TokenKind::Backslash;

    table
}

static SINGLE_CHAR_TOKENS: [TokenKind; 128] = build_single_char_table();

/// 入力エンコーディング
///
/// トークン列には影響せず、不明な上位バイトの報告文言だけが変わる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEncoding {
    Utf8,
    Ascii,
    Latin1,
}

/// レキサーのオプション
#[derive(Debug, Clone)]
pub struct LexerOptions {
    /// コメントをトークンとして残す
    pub retain_comments: bool,
    /// 空白・改行をトークンとして残す
    pub retain_whitespace: bool,
    /// Unicode識別子の許可（予約。現在は未使用）
    pub allow_unicode_identifiers: bool,
    /// レキサー警告をエラーとして扱う（助言的。報告は診断マネージャ経由）
    pub warnings_as_errors: bool,
    /// 厳格モード（助言的）
    pub strict_mode: bool,

    // 性能オプション（トークン列を変えてはならない）
    /// 一括バッチ走査を使う
    pub enable_simd_optimizations: bool,
    /// 文字分類に参照テーブルを使う
    pub enable_lookup_tables: bool,
    /// メモリプリフェッチを有効にする（このビルドでは統計のみ）
    pub enable_prefetching: bool,
    /// 頻出トークンの高速パスを使う
    pub enable_fast_path: bool,

    /// 入力エンコーディング
    pub input_encoding: InputEncoding,
}

impl Default for LexerOptions {
    fn default() -> Self {
        Self {
            retain_comments: false,
            retain_whitespace: false,
            allow_unicode_identifiers: true,
            warnings_as_errors: false,
            strict_mode: false,
            enable_simd_optimizations: false,
            enable_lookup_tables: true,
            enable_prefetching: true,
            enable_fast_path: true,
            input_encoding: InputEncoding::Utf8,
        }
    }
}

/// レキサーの統計情報
#[derive(Debug, Clone, Default)]
pub struct LexerStats {
    /// 生成したトークン数
    pub token_count: usize,
    /// 識別子の数
    pub identifier_count: usize,
    /// キーワードの数
    pub keyword_count: usize,
    /// リテラルの数
    pub literal_count: usize,
    /// コメントの数
    pub comment_count: usize,
    /// 行数
    pub line_count: usize,
    /// 処理したバイト数
    pub character_count: usize,
    /// 累積の字句解析時間
    pub lexing_time: Duration,
    /// バッチ走査の回数（プロファイル用）
    pub simd_batches: usize,
    /// 参照テーブルの利用回数（プロファイル用）
    pub lookup_table_hits: usize,
}

impl LexerStats {
    /// トークンあたりの平均バイト長
    pub fn average_token_length(&self) -> f64 {
        if self.token_count > 0 {
            self.character_count as f64 / self.token_count as f64
        } else {
            0.0
        }
    }

    /// 別の統計を合算する
    pub fn merge(&mut self, other: &LexerStats) {
        self.token_count += other.token_count;
        self.identifier_count += other.identifier_count;
        self.keyword_count += other.keyword_count;
        self.literal_count += other.literal_count;
        self.comment_count += other.comment_count;
        self.line_count += other.line_count;
        self.character_count += other.character_count;
        self.lexing_time += other.lexing_time;
        self.simd_batches += other.simd_batches;
        self.lookup_table_hits += other.lookup_table_hits;
    }
}

impl std::fmt::Display for LexerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Lexer Statistics:")?;
        writeln!(f, "  Total Characters Processed: {}", self.character_count)?;
        writeln!(f, "  Total Tokens Lexed: {}", self.token_count)?;
        writeln!(f, "  Identifiers: {}", self.identifier_count)?;
        writeln!(f, "  Keywords: {}", self.keyword_count)?;
        writeln!(f, "  Literals: {}", self.literal_count)?;
        writeln!(f, "  Comments: {}", self.comment_count)?;
        writeln!(f, "  Total Lines: {}", self.line_count)?;
        writeln!(f, "  Total Lexing Time: {:?}", self.lexing_time)?;
        writeln!(f, "  Batch Scans: {}", self.simd_batches)?;
        writeln!(f, "  Lookup Table Hits: {}", self.lookup_table_hits)?;
        write!(
            f,
            "  Average Token Length: {:.2}",
            self.average_token_length()
        )
    }
}

/// 字句解析器
pub struct Lexer<'a> {
    /// 位置解決に使うソースマネージャ（生スライス入力ではNone）
    source_manager: Option<&'a SourceManager>,
    /// 対象ファイル
    fid: FileId,
    /// 綴りのインターンに使うインターナ
    interner: &'a StringInterner,
    /// 字句エラーの報告先
    diagnostics: &'a DiagnosticManager,
    /// オプション
    options: LexerOptions,

    /// 入力バイト列
    source: &'a [u8],
    /// 現在位置（バイトオフセット）
    pos: usize,
    /// 現在行の先頭オフセット
    line_start: usize,
    /// 現在の行番号（1始まり）
    current_line: u32,
    /// ファイル先頭のグローバル位置（生スライス入力では無効）
    base_loc: SourceLocation,

    /// 先読み済みトークン（高々1つ）
    peeked: Option<Token>,
    /// Iterator実装用: EOFを返し終えたか
    finished: bool,

    /// 統計情報
    stats: LexerStats,
}

impl<'a> Lexer<'a> {
    /// SourceManager管理下のファイルを対象にレキサーを作成
    pub fn from_file(
        source_manager: &'a SourceManager,
        fid: FileId,
        interner: &'a StringInterner,
        diagnostics: &'a DiagnosticManager,
        options: LexerOptions,
    ) -> Self {
        let base_loc = source_manager.start_loc(fid);
        let source = source_manager.character_data(base_loc).unwrap_or(&[]);
        Self {
            source_manager: Some(source_manager),
            fid,
            interner,
            diagnostics,
            options,
            source,
            pos: 0,
            line_start: 0,
            current_line: 1,
            base_loc,
            peeked: None,
            finished: false,
            stats: LexerStats::default(),
        }
    }

    /// 生のバイトスライスを対象にレキサーを作成。位置情報は無効になる。
    pub fn from_bytes(
        source: &'a [u8],
        interner: &'a StringInterner,
        diagnostics: &'a DiagnosticManager,
        options: LexerOptions,
    ) -> Self {
        Self {
            source_manager: None,
            fid: FileId::invalid(),
            interner,
            diagnostics,
            options,
            source,
            pos: 0,
            line_start: 0,
            current_line: 1,
            base_loc: SourceLocation::invalid(),
            peeked: None,
            finished: false,
            stats: LexerStats::default(),
        }
    }

    /// 次のトークンを取得する
    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.peeked.take() {
            return token;
        }

        let started = Instant::now();
        let mut has_leading_space = false;

        let token = loop {
            // どちらも保持しない場合はトリビアをまとめて読み飛ばす
            if !self.options.retain_whitespace && !self.options.retain_comments {
                let before = self.pos;
                self.skip_trivia();
                if self.pos != before {
                    has_leading_space = true;
                }
            }

            if self.is_at_end() {
                break Token::new(TokenKind::EndOfFile, self.location_at(self.pos), 0);
            }

            let at_start_of_line = self.pos == self.line_start;
            if self.options.enable_lookup_tables {
                self.stats.lookup_table_hits += 1;
            }

            let c = self.source[self.pos];

            let mut token = if is_alpha(c) {
                self.lex_identifier()
            } else if is_digit(c) {
                self.lex_number()
            } else if is_whitespace(c) {
                if self.options.retain_whitespace {
                    let start = self.pos;
                    self.skip_whitespace_run();
                    self.make_token(TokenKind::Whitespace, start)
                } else {
                    self.skip_whitespace_run();
                    has_leading_space = true;
                    continue;
                }
            } else if is_newline(c) {
                if self.options.retain_whitespace {
                    let start = self.pos;
                    self.handle_newline();
                    self.make_token(TokenKind::Newline, start)
                } else {
                    self.handle_newline();
                    has_leading_space = true;
                    continue;
                }
            } else if c == b'"' {
                self.lex_string()
            } else if c == b'\'' {
                self.lex_char_literal()
            } else if c == b'/' && matches!(self.peek(1), b'/' | b'*') {
                if self.options.retain_comments {
                    self.lex_comment()
                } else {
                    if self.peek(1) == b'/' {
                        self.skip_line_comment();
                    } else {
                        self.skip_block_comment();
                    }
                    has_leading_space = true;
                    continue;
                }
            } else {
                self.lex_operator()
            };

            if at_start_of_line {
                token.add_flag(TokenFlags::AT_START_OF_LINE);
            }
            if has_leading_space {
                token.add_flag(TokenFlags::HAS_LEADING_SPACE);
            }
            break token;
        };

        self.stats.token_count += 1;
        self.stats.lexing_time += started.elapsed();
        token
    }

    /// 次のトークンを消費せずに覗く。バッファされるのは高々1つ。
    pub fn peek_token(&mut self) -> &Token {
        if self.peeked.is_none() {
            let token = self.next_token();
            self.peeked = Some(token);
        }
        self.peeked.as_ref().expect("peeked token must exist")
    }

    /// 入力の終端に到達したか
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    /// 現在位置のグローバル位置を取得
    pub fn current_location(&self) -> SourceLocation {
        self.location_at(self.pos)
    }

    /// 現在の行番号（1始まり）を取得
    pub fn current_line(&self) -> u32 {
        self.current_line
    }

    /// 現在の列番号（1始まり）を取得
    pub fn current_column(&self) -> u32 {
        (self.pos - self.line_start) as u32 + 1
    }

    /// 現在行の末尾（改行の直前）まで読み飛ばす
    pub fn skip_to_end_of_line(&mut self) {
        while self.pos < self.source.len() && !is_newline(self.source[self.pos]) {
            self.pos += 1;
        }
    }

    /// 入力の先頭まで巻き戻し、統計もリセットする
    pub fn reset(&mut self) {
        self.pos = 0;
        self.line_start = 0;
        self.current_line = 1;
        self.peeked = None;
        self.finished = false;
        self.stats = LexerStats::default();
    }

    /// 対象ファイルのFileIDを取得（生スライス入力では無効ID）
    pub fn file_id(&self) -> FileId {
        self.fid
    }

    /// 位置解決に使っているソースマネージャを取得
    pub fn source_manager(&self) -> Option<&'a SourceManager> {
        self.source_manager
    }

    /// オプションを取得
    pub fn options(&self) -> &LexerOptions {
        &self.options
    }

    /// 統計情報のスナップショットを取得
    pub fn stats(&self) -> LexerStats {
        let mut stats = self.stats.clone();
        stats.character_count = self.pos;
        stats.line_count = self.current_line as usize;
        stats
    }

    // ----- 内部ヘルパー -----

    fn peek(&self, offset: usize) -> u8 {
        self.source.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn location_at(&self, pos: usize) -> SourceLocation {
        if self.base_loc.is_invalid() {
            return SourceLocation::invalid();
        }
        SourceLocation::from_raw_encoding(self.base_loc.raw_encoding() + pos as u32)
    }

    fn make_token(&self, kind: TokenKind, start: usize) -> Token {
        Token::new(kind, self.location_at(start), (self.pos - start) as u32)
    }

    /// 空白・改行・コメントをまとめて読み飛ばす
    fn skip_trivia(&mut self) {
        while self.pos < self.source.len() {
            let c = self.source[self.pos];
            if is_whitespace(c) {
                self.skip_whitespace_run();
            } else if is_newline(c) {
                self.handle_newline();
            } else if c == b'/' && self.peek(1) == b'/' {
                self.skip_line_comment();
            } else if c == b'/' && self.peek(1) == b'*' {
                self.skip_block_comment();
            } else {
                break;
            }
        }
    }

    /// 連続する空白（改行以外）を読み飛ばす
    fn skip_whitespace_run(&mut self) {
        if self.options.enable_simd_optimizations {
            // 16バイト単位のバッチ判定。トークン列は変えず、統計だけが変わる。
            while self.pos + 16 <= self.source.len() {
                let chunk = &self.source[self.pos..self.pos + 16];
                self.stats.simd_batches += 1;
                match chunk.iter().position(|&b| !is_whitespace(b)) {
                    Some(idx) => {
                        self.pos += idx;
                        return;
                    }
                    None => self.pos += 16,
                }
            }
        }

        while self.pos < self.source.len() && is_whitespace(self.source[self.pos]) {
            self.pos += 1;
        }
    }

    /// 改行（CR、LF、CR LF）を1つ消費し、行カウンタを進める
    fn handle_newline(&mut self) {
        if self.source[self.pos] == b'\r' {
            self.pos += 1;
            if self.pos < self.source.len() && self.source[self.pos] == b'\n' {
                self.pos += 1;
            }
        } else {
            self.pos += 1;
        }
        self.current_line += 1;
        self.line_start = self.pos;
    }

    /// 識別子またはキーワードを読む
    fn lex_identifier(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.source.len() && is_alnum(self.source[self.pos]) {
            self.pos += 1;
        }

        let text = &self.source[start..self.pos];
        match TokenKind::keyword_kind(text) {
            Some(kind) => {
                self.stats.keyword_count += 1;
                let mut token = self.make_token(kind, start);
                token.add_flag(TokenFlags::IS_KEYWORD);
                token
            }
            None => {
                self.stats.identifier_count += 1;
                let handle = self.interner.intern(text);
                Token::with_text(
                    TokenKind::Identifier,
                    self.location_at(start),
                    (self.pos - start) as u32,
                    handle,
                )
            }
        }
    }

    /// 数値リテラルを読む
    ///
    /// 接頭辞（`0x` / `0b` / 先頭 `0` の8進）は先頭の `0` の後で決まる。
    /// 「数字・ドット・数字」は常に浮動小数点として消費する。
    /// 接尾辞（英字列）は検証せず綴りの一部として残す。
    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        let mut kind = TokenKind::Integer;

        if self.source[self.pos] == b'0' && self.pos + 1 < self.source.len() {
            let next = self.source[self.pos + 1];
            if next == b'x' || next == b'X' {
                self.pos += 2;
                while self.pos < self.source.len() && is_hex_digit(self.source[self.pos]) {
                    self.pos += 1;
                }
            } else if next == b'b' || next == b'B' {
                self.pos += 2;
                while self.pos < self.source.len()
                    && (self.source[self.pos] == b'0' || self.source[self.pos] == b'1')
                {
                    self.pos += 1;
                }
            } else {
                // 8進数、または単独の0
                self.pos += 1;
                while self.pos < self.source.len() && is_octal_digit(self.source[self.pos]) {
                    self.pos += 1;
                }
            }
        } else {
            while self.pos < self.source.len() && is_digit(self.source[self.pos]) {
                self.pos += 1;
            }
        }

        // 小数点: 直後に数字が続くときだけ浮動小数点として消費する
        if self.pos < self.source.len()
            && self.source[self.pos] == b'.'
            && self.pos + 1 < self.source.len()
            && is_digit(self.source[self.pos + 1])
        {
            kind = TokenKind::Float;
            self.pos += 1;
            while self.pos < self.source.len() && is_digit(self.source[self.pos]) {
                self.pos += 1;
            }

            // 指数部
            if self.pos < self.source.len()
                && (self.source[self.pos] == b'e' || self.source[self.pos] == b'E')
            {
                self.pos += 1;
                if self.pos < self.source.len()
                    && (self.source[self.pos] == b'+' || self.source[self.pos] == b'-')
                {
                    self.pos += 1;
                }
                while self.pos < self.source.len() && is_digit(self.source[self.pos]) {
                    self.pos += 1;
                }
            }
        }

        // 接尾辞（u、l、f など。字句段階では検証しない）
        while self.pos < self.source.len() && is_alpha(self.source[self.pos]) {
            self.pos += 1;
        }

        self.stats.literal_count += 1;
        let text = &self.source[start..self.pos];
        let handle = self.interner.intern(text);
        Token::with_text(
            kind,
            self.location_at(start),
            (self.pos - start) as u32,
            handle,
        )
    }

    /// 認識済みエスケープの後続（16進・8進・Unicode桁）を消費する
    fn consume_escape_payload(&mut self, escaped: u8) {
        match escaped {
            b'x' => {
                let mut count = 0;
                while count < 2
                    && self.pos < self.source.len()
                    && is_hex_digit(self.source[self.pos])
                {
                    self.pos += 1;
                    count += 1;
                }
            }
            b'u' => {
                let mut count = 0;
                while count < 4
                    && self.pos < self.source.len()
                    && is_hex_digit(self.source[self.pos])
                {
                    self.pos += 1;
                    count += 1;
                }
            }
            b'U' => {
                let mut count = 0;
                while count < 8
                    && self.pos < self.source.len()
                    && is_hex_digit(self.source[self.pos])
                {
                    self.pos += 1;
                    count += 1;
                }
            }
            b'0'..=b'7' => {
                let mut count = 0;
                while count < 2
                    && self.pos < self.source.len()
                    && is_octal_digit(self.source[self.pos])
                {
                    self.pos += 1;
                    count += 1;
                }
            }
            _ => {}
        }
    }

    /// 認識できないエスケープに警告を出す
    fn check_escape(&mut self, escaped: u8, backslash_pos: usize) {
        let recognized = matches!(
            escaped,
            b'\\' | b'\'' | b'"' | b'?' | b'n' | b't' | b'r' | b'b' | b'f' | b'v' | b'a'
                | b'0'..=b'7' | b'x' | b'u' | b'U'
        );
        if !recognized {
            self.diagnostics.report_with_arg(
                DiagnosticId::UnknownEscapeSequence,
                self.location_at(backslash_pos),
                String::from_utf8_lossy(&[escaped]).into_owned(),
            );
        }
    }

    /// 文字列リテラルを読む
    ///
    /// 生のCR/LFまたはEOFに遭遇すると走査を打ち切り、開き引用符の
    /// 位置で `UnterminatedStringLiteral` を報告する（改行は消費しない）。
    fn lex_string(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1; // 開き引用符

        let mut has_escapes = false;
        let mut terminated = false;

        while self.pos < self.source.len() {
            let c = self.source[self.pos];
            if c == b'"' {
                self.pos += 1;
                terminated = true;
                break;
            }
            if is_newline(c) {
                break;
            }
            if c == b'\\' {
                has_escapes = true;
                let backslash_pos = self.pos;
                self.pos += 1;
                if self.pos >= self.source.len() {
                    break;
                }
                let escaped = self.source[self.pos];
                self.pos += 1;
                self.consume_escape_payload(escaped);
                self.check_escape(escaped, backslash_pos);
            } else {
                self.pos += 1;
            }
        }

        if !terminated {
            self.diagnostics.report_id(
                DiagnosticId::UnterminatedStringLiteral,
                self.location_at(start),
            );
        }

        self.stats.literal_count += 1;
        let text = &self.source[start..self.pos];
        let handle = self.interner.intern(text);
        let mut token = Token::with_text(
            TokenKind::String,
            self.location_at(start),
            (self.pos - start) as u32,
            handle,
        );
        if has_escapes {
            token.add_flag(TokenFlags::NEEDS_CLEANING);
        }
        token
    }

    /// 文字リテラルを読む。論理的に1文字のみを期待する。
    fn lex_char_literal(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1; // 開き引用符

        let mut has_escape = false;

        if self.pos < self.source.len()
            && self.source[self.pos] != b'\''
            && !is_newline(self.source[self.pos])
        {
            if self.source[self.pos] == b'\\' {
                has_escape = true;
                let backslash_pos = self.pos;
                self.pos += 1;
                if self.pos < self.source.len() {
                    let escaped = self.source[self.pos];
                    self.pos += 1;
                    self.consume_escape_payload(escaped);
                    self.check_escape(escaped, backslash_pos);
                }
            } else {
                self.pos += 1;
            }
        }

        if self.pos >= self.source.len() || self.source[self.pos] != b'\'' {
            self.diagnostics.report_id(
                DiagnosticId::UnterminatedCharacterLiteral,
                self.location_at(start),
            );
        } else {
            self.pos += 1; // 閉じ引用符
        }

        self.stats.literal_count += 1;
        let text = &self.source[start..self.pos];
        let handle = self.interner.intern(text);
        let mut token = Token::with_text(
            TokenKind::Character,
            self.location_at(start),
            (self.pos - start) as u32,
            handle,
        );
        if has_escape {
            token.add_flag(TokenFlags::NEEDS_CLEANING);
        }
        token
    }

    /// コメントをトークンとして読む（`retain_comments` 有効時）
    fn lex_comment(&mut self) -> Token {
        let start = self.pos;

        if self.peek(1) == b'/' {
            // 行コメント: 次の改行の手前まで
            self.pos += 2;
            while self.pos < self.source.len() && !is_newline(self.source[self.pos]) {
                self.pos += 1;
            }
            self.stats.comment_count += 1;
            return self.make_token(TokenKind::LineComment, start);
        }

        // ブロックコメント: 終端 `*/` を含む。内部の改行は行カウンタを進める。
        self.pos += 2;
        let mut terminated = false;
        while self.pos < self.source.len() {
            if self.source[self.pos] == b'*' && self.peek(1) == b'/' {
                self.pos += 2;
                terminated = true;
                break;
            }
            if is_newline(self.source[self.pos]) {
                self.handle_newline();
            } else {
                self.pos += 1;
            }
        }

        if !terminated {
            self.diagnostics.report_id(
                DiagnosticId::UnterminatedBlockComment,
                self.location_at(start),
            );
        }

        self.stats.comment_count += 1;
        self.make_token(TokenKind::BlockComment, start)
    }

    fn skip_line_comment(&mut self) {
        self.pos += 2;
        while self.pos < self.source.len() && !is_newline(self.source[self.pos]) {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        let start = self.pos;
        self.pos += 2;
        let mut terminated = false;
        while self.pos < self.source.len() {
            if self.source[self.pos] == b'*' && self.peek(1) == b'/' {
                self.pos += 2;
                terminated = true;
                break;
            }
            if is_newline(self.source[self.pos]) {
                self.handle_newline();
            } else {
                self.pos += 1;
            }
        }
        if !terminated {
            self.diagnostics.report_id(
                DiagnosticId::UnterminatedBlockComment,
                self.location_at(start),
            );
        }
    }

    /// 演算子・区切り記号を読む。2バイト演算子を最長一致で優先する。
    fn lex_operator(&mut self) -> Token {
        let start = self.pos;
        let c = self.source[self.pos];
        self.pos += 1;

        if self.pos < self.source.len() {
            let next = self.source[self.pos];
            let two_byte = match (c, next) {
                (b'+', b'=') => Some(TokenKind::PlusEqual),
                (b'+', b'+') => Some(TokenKind::PlusPlus),
                (b'-', b'=') => Some(TokenKind::MinusEqual),
                (b'-', b'-') => Some(TokenKind::MinusMinus),
                (b'-', b'>') => Some(TokenKind::Arrow),
                (b'*', b'=') => Some(TokenKind::StarEqual),
                (b'/', b'=') => Some(TokenKind::SlashEqual),
                (b'%', b'=') => Some(TokenKind::PercentEqual),
                (b'=', b'=') => Some(TokenKind::EqualEqual),
                (b'!', b'=') => Some(TokenKind::NotEqual),
                (b'<', b'=') => Some(TokenKind::LessEqual),
                (b'<', b'<') => Some(TokenKind::LessLess),
                (b'>', b'=') => Some(TokenKind::GreaterEqual),
                (b'>', b'>') => Some(TokenKind::GreaterGreater),
                (b'&', b'&') => Some(TokenKind::AmpAmp),
                (b'|', b'|') => Some(TokenKind::PipePipe),
                (b':', b':') => Some(TokenKind::ColonColon),
                _ => None,
            };
            if let Some(kind) = two_byte {
                self.pos += 1;
                return self.make_token(kind, start);
            }
        }

        if c < 128 {
            if self.options.enable_lookup_tables {
                self.stats.lookup_table_hits += 1;
            }
            let kind = SINGLE_CHAR_TOKENS[c as usize];
            if kind != TokenKind::Unknown {
                return self.make_token(kind, start);
            }
        }

        // この言語の字句に現れないバイト
        let loc = self.location_at(start);
        if c < 32 || c >= 127 {
            self.diagnostics.report_with_args(
                DiagnosticId::UnexpectedValue,
                loc,
                self.expected_description(c),
                format!("文字コード {}", c),
            );
        } else {
            self.diagnostics.report_with_args(
                DiagnosticId::UnexpectedValue,
                loc,
                "有効な文字",
                format!("'{}'", c as char),
            );
        }
        self.make_token(TokenKind::Unknown, start)
    }

    /// 不明バイト報告時の「期待した値」の文言。
    /// 上位バイトの表現だけが入力エンコーディング設定に依存する。
    fn expected_description(&self, c: u8) -> &'static str {
        if c >= 0x80 {
            match self.options.input_encoding {
                InputEncoding::Utf8 => "有効なUTF-8文字",
                InputEncoding::Ascii => "有効なASCII文字",
                InputEncoding::Latin1 => "有効なLatin-1文字",
            }
        } else {
            "有効な文字（非表示文字）"
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.finished {
            return None;
        }
        let token = self.next_token();
        if token.kind() == TokenKind::EndOfFile {
            self.finished = true;
        }
        Some(token)
    }
}

/// エスケープシーケンス1つをデコードする。
/// `i` はバックスラッシュの次の位置を指していること。復帰時には
/// シーケンスの直後を指す。
fn decode_escape(bytes: &[u8], i: &mut usize) -> u8 {
    let c = bytes[*i];
    *i += 1;

    match c {
        b'n' => b'\n',
        b't' => b'\t',
        b'r' => b'\r',
        b'b' => 0x08,
        b'f' => 0x0C,
        b'v' => 0x0B,
        b'a' => 0x07,
        b'\\' => b'\\',
        b'\'' => b'\'',
        b'"' => b'"',
        b'?' => b'?',
        // 8進エスケープ \nnn（1〜3桁）
        b'0'..=b'7' => {
            let mut value = (c - b'0') as u32;
            let mut count = 0;
            while count < 2 && *i < bytes.len() && is_octal_digit(bytes[*i]) {
                value = value * 8 + (bytes[*i] - b'0') as u32;
                *i += 1;
                count += 1;
            }
            value as u8
        }
        // 16進エスケープ \xHH（1〜2桁）
        b'x' => {
            let mut value = 0u32;
            let mut digits = 0;
            while digits < 2 && *i < bytes.len() && is_hex_digit(bytes[*i]) {
                value = value * 16 + hex_value(bytes[*i]);
                *i += 1;
                digits += 1;
            }
            if digits == 0 {
                return b'x'; // 桁なしは 'x' そのもの
            }
            value as u8
        }
        // Unicodeエスケープ \uHHHH（4桁固定）
        b'u' => {
            let mut value = 0u32;
            let mut digits = 0;
            while digits < 4 && *i < bytes.len() && is_hex_digit(bytes[*i]) {
                value = value * 16 + hex_value(bytes[*i]);
                *i += 1;
                digits += 1;
            }
            if digits < 4 {
                return b'u';
            }
            // コードポイントの下位バイトを返す（UTF-8展開は対象外）
            (value & 0xFF) as u8
        }
        // Unicodeエスケープ \UHHHHHHHH（8桁固定）
        b'U' => {
            let mut value = 0u32;
            let mut digits = 0;
            while digits < 8 && *i < bytes.len() && is_hex_digit(bytes[*i]) {
                value = value * 16 + hex_value(bytes[*i]);
                *i += 1;
                digits += 1;
            }
            if digits < 8 {
                return b'U';
            }
            (value & 0xFF) as u8
        }
        // 未知のエスケープは文字そのもの
        other => other,
    }
}

fn hex_value(c: u8) -> u32 {
    match c {
        b'0'..=b'9' => (c - b'0') as u32,
        b'a'..=b'f' => (c - b'a' + 10) as u32,
        b'A'..=b'F' => (c - b'A' + 10) as u32,
        _ => 0,
    }
}

/// 文字列リテラルの生の綴り（引用符付き）をデコードする純関数
pub fn clean_string_literal(raw: &[u8]) -> Vec<u8> {
    if raw.len() < 2 {
        return raw.to_vec();
    }

    let content = &raw[1..raw.len() - 1];
    let mut result = Vec::with_capacity(content.len());

    let mut i = 0;
    while i < content.len() {
        if content[i] == b'\\' && i + 1 < content.len() {
            i += 1;
            result.push(decode_escape(content, &mut i));
        } else {
            result.push(content[i]);
            i += 1;
        }
    }

    result
}

/// 文字リテラルの生の綴り（引用符付き）をデコードする純関数
pub fn clean_char_literal(raw: &[u8]) -> u8 {
    if raw.len() < 3 {
        return 0;
    }

    let content = &raw[1..raw.len() - 1];
    if content.is_empty() {
        return 0;
    }

    if content[0] == b'\\' && content.len() >= 2 {
        let mut i = 1;
        decode_escape(content, &mut i)
    } else {
        content[0]
    }
}

/// バイト列をEOFまでトークン化する便宜関数
pub fn tokenize_bytes(
    source: &[u8],
    interner: &StringInterner,
    diagnostics: &DiagnosticManager,
    options: LexerOptions,
) -> Vec<Token> {
    let mut lexer = Lexer::from_bytes(source, interner, diagnostics, options);
    // トークン密度はおおむね7バイトに1つ
    let mut tokens = Vec::with_capacity(source.len() / 7 + 64);

    loop {
        let token = lexer.next_token();
        let done = token.kind() == TokenKind::EndOfFile;
        tokens.push(token);
        if done {
            break;
        }
    }

    tokens
}

/// ファイルをEOFまでトークン化する便宜関数
pub fn tokenize_file(
    source_manager: &SourceManager,
    fid: FileId,
    interner: &StringInterner,
    diagnostics: &DiagnosticManager,
    options: LexerOptions,
) -> Vec<Token> {
    let mut lexer = Lexer::from_file(source_manager, fid, interner, diagnostics, options);
    let capacity = source_manager
        .file_entry(fid)
        .map(|entry| entry.size() / 7 + 64)
        .unwrap_or(1024);
    let mut tokens = Vec::with_capacity(capacity);

    loop {
        let token = lexer.next_token();
        let done = token.kind() == TokenKind::EndOfFile;
        tokens.push(token);
        if done {
            break;
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    // トークンの綴りハンドルはインターナを指すため、一緒に返して生かしておく
    fn lex(source: &str) -> (Vec<Token>, StringInterner, DiagnosticManager) {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let tokens = tokenize_bytes(
            source.as_bytes(),
            &interner,
            &diagnostics,
            LexerOptions::default(),
        );
        (tokens, interner, diagnostics)
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind()).collect()
    }

    #[test]
    fn test_empty_input_yields_eof() {
        let (tokens, _interner, _diags) = lex("");
        assert_eq!(kinds(&tokens), vec![TokenKind::EndOfFile]);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let (tokens, _interner, _diags) = lex("let foo fn mod bar");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Fn,
                TokenKind::Mod,
                TokenKind::Identifier,
                TokenKind::EndOfFile,
            ]
        );
        assert!(tokens[0].is_keyword());
        assert!(!tokens[1].is_keyword());
        assert_eq!(tokens[1].text().as_bytes(), b"foo");
        // キーワードには綴りハンドルを付けない
        assert!(!tokens[0].text().is_valid());
    }

    #[test]
    fn test_number_spellings() {
        let (tokens, _interner, _diags) = lex("0xFFu 0b10 017 42 3.14 1.5e-3 1e10");
        assert_eq!(tokens[0].kind(), TokenKind::Integer);
        assert_eq!(tokens[0].text().as_bytes(), b"0xFFu");
        assert_eq!(tokens[1].text().as_bytes(), b"0b10");
        assert_eq!(tokens[2].text().as_bytes(), b"017");
        assert_eq!(tokens[3].text().as_bytes(), b"42");
        assert_eq!(tokens[4].kind(), TokenKind::Float);
        assert_eq!(tokens[4].text().as_bytes(), b"3.14");
        assert_eq!(tokens[5].kind(), TokenKind::Float);
        assert_eq!(tokens[5].text().as_bytes(), b"1.5e-3");
        // "1e10" は整数 "1e" と整数 "10" に分かれる（指数は小数部の後のみ）
        assert_eq!(tokens[6].kind(), TokenKind::Integer);
        assert_eq!(tokens[6].text().as_bytes(), b"1e");
        assert_eq!(tokens[7].text().as_bytes(), b"10");
    }

    #[test]
    fn test_dot_after_digits_without_digit() {
        // "1.foo" は 1 / . / foo に分かれる
        let (tokens, _interner, _diags) = lex("1.foo");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Integer,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_two_byte_operators_longest_match() {
        let (tokens, _interner, _diags) = lex("+= ++ -> :: << >= && || == !=");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::PlusEqual,
                TokenKind::PlusPlus,
                TokenKind::Arrow,
                TokenKind::ColonColon,
                TokenKind::LessLess,
                TokenKind::GreaterEqual,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_string_with_escapes_needs_cleaning() {
        let (tokens, _interner, _diags) = lex(r#""a\tb""#);
        assert_eq!(tokens[0].kind(), TokenKind::String);
        assert!(tokens[0].needs_cleaning());
        assert_eq!(tokens[0].text().as_bytes(), br#""a\tb""#);

        let (plain, _interner2, _diags2) = lex(r#""plain""#);
        assert!(!plain[0].needs_cleaning());
    }

    #[test]
    fn test_clean_string_literal_escapes() {
        assert_eq!(clean_string_literal(br#""a\tb""#), b"a\tb");
        assert_eq!(clean_string_literal(br#""\x41\101""#), b"AA");
        assert_eq!(clean_string_literal(br#""A""#), b"A");
        assert_eq!(clean_string_literal(br#""\U00000041""#), b"A");
        // Unicodeエスケープはコードポイントの下位バイトのみ（U+3042 → 0x42）
        assert_eq!(clean_string_literal(br#""\u3042""#), vec![0x42]);
        assert_eq!(clean_string_literal(br#""\0""#), vec![0]);
    }

    #[test]
    fn test_clean_char_literal() {
        assert_eq!(clean_char_literal(b"'a'"), b'a');
        assert_eq!(clean_char_literal(br"'\n'"), b'\n');
        assert_eq!(clean_char_literal(br"'\x41'"), b'A');
        assert_eq!(clean_char_literal(b"''"), 0);
    }

    #[test]
    fn test_peek_then_next_returns_same_token() {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let mut lexer = Lexer::from_bytes(
            b"let x",
            &interner,
            &diagnostics,
            LexerOptions::default(),
        );

        let peeked_kind = lexer.peek_token().kind();
        let peeked_loc = lexer.peek_token().location();
        let next = lexer.next_token();
        assert_eq!(next.kind(), peeked_kind);
        assert_eq!(next.location(), peeked_loc);
        assert_eq!(next.kind(), TokenKind::Let);
    }

    #[test]
    fn test_line_tracking_crlf_collapses() {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let mut lexer = Lexer::from_bytes(
            b"a\r\nb\rc\nd",
            &interner,
            &diagnostics,
            LexerOptions::default(),
        );
        while lexer.next_token().kind() != TokenKind::EndOfFile {}
        // 1行目 + 改行3つ
        assert_eq!(lexer.current_line(), 4);
    }

    #[test]
    fn test_simd_option_does_not_change_stream() {
        let source = "let   x   =   42   ;      // comment\n  fn  f( ) {}";
        let (default_tokens, _interner0, _diags0) = lex(source);

        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let options = LexerOptions {
            enable_simd_optimizations: true,
            enable_lookup_tables: false,
            enable_fast_path: false,
            ..LexerOptions::default()
        };
        let tuned_tokens = tokenize_bytes(source.as_bytes(), &interner, &diagnostics, options);

        assert_eq!(kinds(&default_tokens), kinds(&tuned_tokens));
    }

    #[test]
    fn test_unknown_byte_produces_token_and_diagnostic() {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let tokens = tokenize_bytes(
            &[0x7F, b'x'],
            &interner,
            &diagnostics,
            LexerOptions::default(),
        );

        assert_eq!(tokens[0].kind(), TokenKind::Unknown);
        assert_eq!(tokens[0].length(), 1);
        assert_eq!(tokens[1].kind(), TokenKind::Identifier);
        assert_eq!(diagnostics.stats().error_count, 1);
    }

    #[test]
    fn test_stats_counting() {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let mut lexer = Lexer::from_bytes(
            b"let x = 42; // c",
            &interner,
            &diagnostics,
            LexerOptions::default(),
        );
        while lexer.next_token().kind() != TokenKind::EndOfFile {}

        let stats = lexer.stats();
        assert_eq!(stats.keyword_count, 1);
        assert_eq!(stats.identifier_count, 1);
        assert_eq!(stats.literal_count, 1);
        assert_eq!(stats.character_count, 16);
        assert!(stats.token_count >= 5);
    }
}
