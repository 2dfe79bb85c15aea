//! # 診断コンシューマ
//!
//! 診断の出力先を抽象化する小さなケイパビリティインターフェースと、
//! 組み込みのText/JSONコンシューマを提供します。
//! コンシューマは [`DiagnosticManager`](crate::diagnostics::DiagnosticManager)
//! に登録順で呼び出されます。出力ストリームの直列化は各コンシューマの
//! 責務です。

use std::io::Write;

use colored::Colorize;
use serde_json::{json, Value};
use unicode_width::UnicodeWidthStr;

use crate::diagnostics::messages::{DiagnosticInfo, DiagnosticLevel};
use crate::diagnostics::{format_message, Diagnostic};
use crate::source::location::SourceLocation;
use crate::source::source_manager::SourceManager;

/// 診断出力の抽象インターフェース
pub trait DiagnosticConsumer: Send {
    /// 一連の診断の処理前に呼ばれる
    fn begin_source_file(&mut self) {}

    /// 1件の診断を処理する
    fn handle_diagnostic(
        &mut self,
        diag: &Diagnostic,
        info: &DiagnosticInfo,
        source_manager: Option<&SourceManager>,
    );

    /// 一連の診断の処理後に呼ばれる
    fn end_source_file(&mut self) {}

    /// すべての診断が終わったときに呼ばれる
    fn finish(&mut self) {}
}

/// 人間向けテキスト出力コンシューマ
///
/// `FILE:LINE:COL: LEVEL: MESSAGE` に続けて該当ソース行と
/// キャレット・強調範囲・修正提案を出力します。
pub struct TextDiagnosticConsumer {
    writer: Box<dyn Write + Send>,
    use_colors: bool,
}

impl TextDiagnosticConsumer {
    /// 新しいテキストコンシューマを作成
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            use_colors: true,
        }
    }

    /// 標準エラー出力へ書き出すコンシューマを作成
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    /// 色付き出力を使うかどうかを設定
    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    fn level_string(&self, level: DiagnosticLevel) -> String {
        let text = level.as_str();
        if !self.use_colors {
            return text.to_string();
        }
        match level {
            DiagnosticLevel::Note => text.cyan().to_string(),
            DiagnosticLevel::Warning => text.yellow().to_string(),
            DiagnosticLevel::Error => text.red().to_string(),
            DiagnosticLevel::Fatal => text.red().bold().to_string(),
        }
    }

    /// 該当ソース行とキャレット・強調範囲を出力する
    fn print_source_line(
        &mut self,
        source_manager: &SourceManager,
        loc: SourceLocation,
        diag: &Diagnostic,
    ) {
        let fid = source_manager.file_id(loc);
        if fid.is_invalid() {
            return;
        }
        let entry = match source_manager.file_entry(fid) {
            Some(entry) => entry,
            None => return,
        };

        let bytes = entry.as_bytes();
        let offset = source_manager.file_offset(loc) as usize;
        let offset = offset.min(bytes.len());

        // 行頭へ戻る
        let mut line_start = offset;
        while line_start > 0 && bytes[line_start - 1] != b'\n' {
            line_start -= 1;
        }

        // 行末まで進む
        let mut line_end = line_start;
        while line_end < bytes.len() && bytes[line_end] != b'\n' && bytes[line_end] != b'\r' {
            line_end += 1;
        }

        let line = String::from_utf8_lossy(&bytes[line_start..line_end]);
        let _ = writeln!(self.writer, "{}", line);

        let column = source_manager.column_number(loc);
        if column == 0 {
            return;
        }

        // キャレット行。全角文字を含む行でも桁が揃うよう表示幅で数える。
        let prefix = String::from_utf8_lossy(&bytes[line_start..line_start + (column as usize - 1).min(line_end - line_start)]);
        let prefix_width = UnicodeWidthStr::width(prefix.as_ref());
        let mut highlight: Vec<u8> = vec![b' '; prefix_width];
        highlight.push(b'^');

        // 同一行内の強調範囲に `~` を敷く
        let (line_no, _) = source_manager.line_and_column(loc);
        for range in diag.ranges() {
            if source_manager.file_id(range.begin) != fid {
                continue;
            }
            let (range_line, start_col) = source_manager.line_and_column(range.begin);
            if range_line != line_no {
                continue;
            }
            let end_col = source_manager.column_number(range.end);
            if start_col == 0 || end_col <= start_col {
                continue;
            }
            for col in start_col..end_col {
                let idx = (col - 1) as usize;
                if idx >= highlight.len() {
                    highlight.resize(idx + 1, b' ');
                }
                if highlight[idx] == b' ' {
                    highlight[idx] = b'~';
                }
            }
        }

        let highlight = String::from_utf8_lossy(&highlight).into_owned();
        if self.use_colors {
            let _ = writeln!(self.writer, "{}", highlight.green());
        } else {
            let _ = writeln!(self.writer, "{}", highlight);
        }
    }
}

impl DiagnosticConsumer for TextDiagnosticConsumer {
    fn handle_diagnostic(
        &mut self,
        diag: &Diagnostic,
        info: &DiagnosticInfo,
        source_manager: Option<&SourceManager>,
    ) {
        // 位置の整形。解決できないときは <unknown>。
        let location = match source_manager {
            Some(sm) if diag.location().is_valid() && sm.is_valid_location(diag.location()) => {
                let filename = sm.filename(diag.location());
                let (line, column) = sm.line_and_column(diag.location());
                format!("{}:{}:{}", filename.to_string_lossy(), line, column)
            }
            _ => "<unknown>".to_string(),
        };

        let message = format_message(info.detailed_message, diag.args());
        let level = self.level_string(info.level);
        let _ = writeln!(self.writer, "{}: {}: {}", location, level, message);

        if let Some(sm) = source_manager {
            if diag.location().is_valid() && sm.is_valid_location(diag.location()) {
                self.print_source_line(sm, diag.location(), diag);
            }
        }

        for fixit in diag.fixits() {
            let _ = writeln!(self.writer, "  fix-it: replace with '{}'", fixit.replacement);
        }
    }

    fn finish(&mut self) {
        let _ = self.writer.flush();
    }
}

/// 機械可読なJSON出力コンシューマ
///
/// `begin_source_file` から `end_source_file` までの診断を集め、
/// `{"diagnostics": [...]}` として一括書き出します。
pub struct JsonDiagnosticConsumer {
    writer: Box<dyn Write + Send>,
    diagnostics: Vec<Value>,
}

impl JsonDiagnosticConsumer {
    /// 新しいJSONコンシューマを作成
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            diagnostics: Vec::new(),
        }
    }
}

impl DiagnosticConsumer for JsonDiagnosticConsumer {
    fn begin_source_file(&mut self) {
        self.diagnostics.clear();
    }

    fn handle_diagnostic(
        &mut self,
        diag: &Diagnostic,
        info: &DiagnosticInfo,
        source_manager: Option<&SourceManager>,
    ) {
        let location = match source_manager {
            Some(sm) if diag.location().is_valid() && sm.is_valid_location(diag.location()) => {
                let filename = sm.filename(diag.location());
                let (line, column) = sm.line_and_column(diag.location());
                json!({
                    "file": filename.to_string_lossy(),
                    "line": line,
                    "column": column,
                })
            }
            _ => Value::Null,
        };

        self.diagnostics.push(json!({
            "id": diag.id().raw(),
            "level": info.level.json_str(),
            "message": format_message(info.detailed_message, diag.args()),
            "location": location,
        }));
    }

    fn end_source_file(&mut self) {
        let document = json!({ "diagnostics": self.diagnostics });
        let _ = serde_json::to_writer(&mut self.writer, &document);
        let _ = writeln!(self.writer);
        let _ = self.writer.flush();
        self.diagnostics.clear();
    }

    fn finish(&mut self) {
        let _ = self.writer.flush();
    }
}
