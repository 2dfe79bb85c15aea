//! # トークンバッファ
//!
//! トークン列の格納・索引付き検索・前方走査を提供する補助テーブルと、
//! 複数ソースの一括トークン化を行う [`BatchTokenizer`] を定義します。

use rayon::prelude::*;

use crate::diagnostics::DiagnosticManager;
use crate::source::location::{SourceLocation, SourceRange};
use crate::utils::interner::StringInterner;

use super::token::{Token, TokenKind};
use super::{Lexer, LexerOptions, LexerStats};

/// 位置検索で「見つからない」を表す番兵
pub const TOKEN_NOT_FOUND: usize = usize::MAX;

/// トークンの格納と検索を担うバッファ
///
/// 位置インデックスを構築すると範囲検索が二分探索になる。
/// トークンを追加するとインデックスは無効化され、再構築されるまで
/// 検索は線形走査にフォールバックする。
#[derive(Debug, Default)]
pub struct TokenBuffer {
    tokens: Vec<Token>,
    /// 位置順に並べたトークン添字
    location_index: Vec<usize>,
    location_index_valid: bool,
}

impl TokenBuffer {
    /// 新しいバッファを作成
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// 容量を指定してバッファを作成
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            location_index: Vec::new(),
            location_index_valid: false,
        }
    }

    /// トークンを追加する
    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
        self.location_index_valid = false;
    }

    /// トークン列をまとめて追加する
    pub fn extend<I: IntoIterator<Item = Token>>(&mut self, tokens: I) {
        self.tokens.extend(tokens);
        self.location_index_valid = false;
    }

    /// 添字でトークンを取得
    pub fn get(&self, index: usize) -> Option<&Token> {
        self.tokens.get(index)
    }

    /// トークン数を取得
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// 全トークンを破棄する
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.location_index.clear();
        self.location_index_valid = false;
    }

    /// 容量を予約する
    pub fn reserve(&mut self, additional: usize) {
        self.tokens.reserve(additional);
    }

    /// トークンのイテレータを取得
    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.tokens.iter()
    }

    /// 位置インデックスを構築する。以後の範囲検索が二分探索になる。
    pub fn build_location_index(&mut self) {
        let mut index: Vec<usize> = (0..self.tokens.len()).collect();
        index.sort_by_key(|&i| self.tokens[i].location().raw_encoding());
        self.location_index = index;
        self.location_index_valid = true;
    }

    /// 位置インデックスが最新かどうか
    pub fn location_index_valid(&self) -> bool {
        self.location_index_valid
    }

    /// 指定位置を占有するトークンの添字を返す。
    /// 該当なしは [`TOKEN_NOT_FOUND`]。
    pub fn find_at_location(&self, loc: SourceLocation) -> usize {
        if loc.is_invalid() {
            return TOKEN_NOT_FOUND;
        }
        let raw = loc.raw_encoding();
        for (i, token) in self.tokens.iter().enumerate() {
            let range = token.source_range();
            if raw >= range.begin.raw_encoding() && raw <= range.end.raw_encoding() {
                return i;
            }
        }
        TOKEN_NOT_FOUND
    }

    /// 範囲に開始位置が含まれるトークンの添字を列挙する。
    /// 位置インデックスが最新なら二分探索、そうでなければ線形走査。
    pub fn find_in_range(&self, range: SourceRange) -> Vec<usize> {
        if range.is_invalid() {
            return Vec::new();
        }
        let begin = range.begin.raw_encoding();
        let end = range.end.raw_encoding();

        if self.location_index_valid && !self.location_index.is_empty() {
            let lower = self
                .location_index
                .partition_point(|&i| self.tokens[i].location().raw_encoding() < begin);
            let upper = self
                .location_index
                .partition_point(|&i| self.tokens[i].location().raw_encoding() <= end);
            return self.location_index[lower..upper].to_vec();
        }

        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| {
                let raw = token.location().raw_encoding();
                raw >= begin && raw <= end
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// 指定種別のトークンの添字を列挙する
    pub fn find_by_kind(&self, kind: TokenKind) -> Vec<usize> {
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| token.kind() == kind)
            .map(|(i, _)| i)
            .collect()
    }

    /// 前方走査用のストリームを作成
    pub fn stream(&self) -> TokenStream<'_> {
        TokenStream {
            buffer: self,
            index: 0,
        }
    }

    /// 概算メモリ使用量を取得（バイト）
    pub fn memory_usage(&self) -> usize {
        self.tokens.len() * std::mem::size_of::<Token>()
            + self.location_index.len() * std::mem::size_of::<usize>()
    }
}

impl std::ops::Index<usize> for TokenBuffer {
    type Output = Token;

    fn index(&self, index: usize) -> &Token {
        &self.tokens[index]
    }
}

/// ストリーム終端で返す番兵トークン
static EOF_TOKEN: Token = Token::new(TokenKind::EndOfFile, SourceLocation::invalid(), 0);

/// トークンバッファ上の前方イテレータ
///
/// 終端を越えたアクセスには番兵のEOFトークンを返す。
pub struct TokenStream<'a> {
    buffer: &'a TokenBuffer,
    index: usize,
}

impl<'a> TokenStream<'a> {
    /// 現在のトークンを取得
    pub fn current(&self) -> &'a Token {
        self.buffer.get(self.index).unwrap_or(&EOF_TOKEN)
    }

    /// 先のトークンを覗く（既定で1つ先）
    pub fn peek(&self, offset: usize) -> &'a Token {
        self.buffer.get(self.index + offset).unwrap_or(&EOF_TOKEN)
    }

    /// 1つ進める
    pub fn advance(&mut self) {
        if self.index < self.buffer.len() {
            self.index += 1;
        }
    }

    /// 終端に達したか
    pub fn at_end(&self) -> bool {
        self.index >= self.buffer.len()
    }

    /// 先頭に戻す
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// 現在の添字を取得
    pub fn index(&self) -> usize {
        self.index
    }

    /// 添字を設定
    pub fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}

/// 複数ソースの一括トークン化
///
/// 並列化には `rayon` を使う。統計は全呼び出しを通じて合算される。
pub struct BatchTokenizer<'a> {
    interner: &'a StringInterner,
    diagnostics: &'a DiagnosticManager,
    options: LexerOptions,
    aggregate: std::sync::Mutex<LexerStats>,
}

impl<'a> BatchTokenizer<'a> {
    /// 新しいバッチトークナイザを作成
    pub fn new(
        interner: &'a StringInterner,
        diagnostics: &'a DiagnosticManager,
        options: LexerOptions,
    ) -> Self {
        Self {
            interner,
            diagnostics,
            options,
            aggregate: std::sync::Mutex::new(LexerStats::default()),
        }
    }

    /// 複数ソースを並列にトークン化する。結果は入力と同順。
    pub fn tokenize_parallel(&self, sources: &[&[u8]]) -> Vec<Vec<Token>> {
        let results: Vec<(Vec<Token>, LexerStats)> = sources
            .par_iter()
            .map(|source| self.tokenize_one(source))
            .collect();

        let mut aggregate = self.aggregate.lock().unwrap();
        let mut tokens = Vec::with_capacity(results.len());
        for (list, stats) in results {
            aggregate.merge(&stats);
            tokens.push(list);
        }
        tokens
    }

    /// トークンを1つずつコールバックに流す
    pub fn tokenize_streaming<F: FnMut(&Token)>(&self, source: &[u8], mut callback: F) {
        let mut lexer = Lexer::from_bytes(
            source,
            self.interner,
            self.diagnostics,
            self.options.clone(),
        );

        loop {
            let token = lexer.next_token();
            let done = token.kind() == TokenKind::EndOfFile;
            callback(&token);
            if done {
                break;
            }
        }

        self.aggregate.lock().unwrap().merge(&lexer.stats());
    }

    /// 合算済みの統計を取得
    pub fn aggregate_stats(&self) -> LexerStats {
        self.aggregate.lock().unwrap().clone()
    }

    fn tokenize_one(&self, source: &[u8]) -> (Vec<Token>, LexerStats) {
        let mut lexer = Lexer::from_bytes(
            source,
            self.interner,
            self.diagnostics,
            self.options.clone(),
        );
        let mut tokens = Vec::with_capacity(source.len() / 7 + 64);

        loop {
            let token = lexer.next_token();
            let done = token.kind() == TokenKind::EndOfFile;
            tokens.push(token);
            if done {
                break;
            }
        }

        (tokens, lexer.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::tokenize_bytes;

    fn tokens_for(source: &str) -> (TokenBuffer, StringInterner, DiagnosticManager) {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let tokens = tokenize_bytes(
            source.as_bytes(),
            &interner,
            &diagnostics,
            LexerOptions::default(),
        );
        let mut buffer = TokenBuffer::new();
        buffer.extend(tokens);
        (buffer, interner, diagnostics)
    }

    #[test]
    fn test_find_by_kind() {
        let (buffer, _interner, _diags) = tokens_for("let a = 1; let b = 2;");
        let lets = buffer.find_by_kind(TokenKind::Let);
        assert_eq!(lets.len(), 2);
        assert_eq!(buffer[lets[0]].kind(), TokenKind::Let);
    }

    #[test]
    fn test_stream_with_peek() {
        let (buffer, _interner, _diags) = tokens_for("a b");
        let mut stream = buffer.stream();

        assert_eq!(stream.current().kind(), TokenKind::Identifier);
        assert_eq!(stream.peek(1).kind(), TokenKind::Identifier);
        assert_eq!(stream.peek(2).kind(), TokenKind::EndOfFile);
        // 終端を越えた先読みは番兵EOF
        assert_eq!(stream.peek(100).kind(), TokenKind::EndOfFile);

        stream.advance();
        stream.advance();
        stream.advance();
        assert!(stream.at_end());
        assert_eq!(stream.current().kind(), TokenKind::EndOfFile);

        stream.reset();
        assert_eq!(stream.index(), 0);
    }

    #[test]
    fn test_find_in_range_linear_and_indexed_agree() {
        // 位置が有効になるよう、生スライスではなくダミー位置を付与する
        let mut buffer = TokenBuffer::new();
        for i in 0..10u32 {
            buffer.push(Token::new(
                TokenKind::Identifier,
                SourceLocation::from_raw_encoding(i * 10 + 1),
                5,
            ));
        }

        let range = SourceRange::new(
            SourceLocation::from_raw_encoding(11),
            SourceLocation::from_raw_encoding(41),
        );

        let linear = buffer.find_in_range(range);
        buffer.build_location_index();
        assert!(buffer.location_index_valid());
        let indexed = buffer.find_in_range(range);

        assert_eq!(linear, indexed);
        assert_eq!(linear, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_find_at_location() {
        let mut buffer = TokenBuffer::new();
        buffer.push(Token::new(
            TokenKind::Identifier,
            SourceLocation::from_raw_encoding(1),
            3,
        ));
        buffer.push(Token::new(
            TokenKind::Equal,
            SourceLocation::from_raw_encoding(5),
            1,
        ));

        assert_eq!(
            buffer.find_at_location(SourceLocation::from_raw_encoding(2)),
            0
        );
        assert_eq!(
            buffer.find_at_location(SourceLocation::from_raw_encoding(5)),
            1
        );
        assert_eq!(
            buffer.find_at_location(SourceLocation::from_raw_encoding(100)),
            TOKEN_NOT_FOUND
        );
    }

    #[test]
    fn test_push_invalidates_index() {
        let mut buffer = TokenBuffer::new();
        buffer.push(Token::new(
            TokenKind::Identifier,
            SourceLocation::from_raw_encoding(1),
            1,
        ));
        buffer.build_location_index();
        assert!(buffer.location_index_valid());

        buffer.push(Token::new(
            TokenKind::Identifier,
            SourceLocation::from_raw_encoding(10),
            1,
        ));
        assert!(!buffer.location_index_valid());
    }

    #[test]
    fn test_batch_tokenize_parallel() {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let batch = BatchTokenizer::new(&interner, &diagnostics, LexerOptions::default());

        let sources: Vec<&[u8]> = vec![b"let a = 1;", b"fn f() {}", b""];
        let results = batch.tokenize_parallel(&sources);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0][0].kind(), TokenKind::Let);
        assert_eq!(results[1][0].kind(), TokenKind::Fn);
        assert_eq!(results[2][0].kind(), TokenKind::EndOfFile);

        let stats = batch.aggregate_stats();
        assert!(stats.token_count >= 12);
    }

    #[test]
    fn test_batch_tokenize_streaming() {
        let interner = StringInterner::new();
        let diagnostics = DiagnosticManager::new();
        let batch = BatchTokenizer::new(&interner, &diagnostics, LexerOptions::default());

        let mut seen = Vec::new();
        batch.tokenize_streaming(b"a + b", |token| seen.push(token.kind()));

        assert_eq!(
            seen,
            vec![
                TokenKind::Identifier,
                TokenKind::Plus,
                TokenKind::Identifier,
                TokenKind::EndOfFile,
            ]
        );
    }
}
