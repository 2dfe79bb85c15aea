//! ソース管理（FileManager / SourceManager）の結合テスト

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use lumina_compiler::{FileManager, SourceLocation, SourceManager, SourceRange, StringInterner};

struct Fixture {
    source_manager: Arc<SourceManager>,
    _dir: tempfile::TempDir,
    dir_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();
        let interner = Arc::new(StringInterner::new());
        let file_manager = Arc::new(FileManager::new(interner));
        let source_manager = Arc::new(SourceManager::new(file_manager));
        Self {
            source_manager,
            _dir: dir,
            dir_path,
        }
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir_path.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }
}

#[test]
fn location_round_trip_for_every_offset() {
    let fixture = Fixture::new();
    let path = fixture.write_file("a.lm", b"let x = 1;\nlet y = 2;\n");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();
    let size = sm.file_entry(fid).unwrap().size() as u32;

    // ファイル終端位置も含めて全オフセットが往復する
    for offset in 0..=size {
        let loc = sm.loc_for_file_offset(fid, offset);
        assert!(loc.is_valid());
        assert_eq!(sm.file_id(loc), fid, "offset {}", offset);
        assert_eq!(sm.file_offset(loc), offset, "offset {}", offset);
    }

    // 範囲外のオフセットは無効
    assert!(sm.loc_for_file_offset(fid, size + 1).is_invalid());
}

#[test]
fn line_and_column_sanity() {
    let fixture = Fixture::new();
    let contents = b"ab\nc\n\nxyz";
    let path = fixture.write_file("b.lm", contents);
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    // 行数 = '\n' の数 + 1（末尾改行なしでも最終行は数えられる）
    assert_eq!(sm.line_count(fid), 4);

    let line_count = sm.line_count(fid) as u32;
    for offset in 0..contents.len() as u32 {
        let loc = sm.loc_for_file_offset(fid, offset);
        let (line, column) = sm.line_and_column(loc);
        assert!(line >= 1 && line <= line_count);
        assert!(column >= 1);

        // 行頭の列は1、その前のバイト（あれば）は改行
        if column == 1 && offset > 0 {
            assert_eq!(contents[offset as usize - 1], b'\n');
        }
    }

    // 個別の位置の検算
    assert_eq!(sm.line_and_column(sm.loc_for_file_offset(fid, 0)), (1, 1));
    assert_eq!(sm.line_and_column(sm.loc_for_file_offset(fid, 3)), (2, 1));
    assert_eq!(sm.line_and_column(sm.loc_for_file_offset(fid, 5)), (3, 1));
    assert_eq!(sm.line_and_column(sm.loc_for_file_offset(fid, 8)), (4, 3));
}

#[test]
fn same_path_returns_same_file_id() {
    let fixture = Fixture::new();
    let path = fixture.write_file("c.lm", b"abc");
    let sm = &fixture.source_manager;

    let first = sm.create_file(&path).unwrap();
    let second = sm.create_file(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(sm.file_count(), 1);
}

#[test]
fn distinct_files_occupy_disjoint_location_ranges() {
    let fixture = Fixture::new();
    let path_a = fixture.write_file("a.lm", b"aaaa");
    let path_b = fixture.write_file("b.lm", b"bbbbbbbb");
    let sm = &fixture.source_manager;

    let fid_a = sm.create_file(&path_a).unwrap();
    let fid_b = sm.create_file(&path_b).unwrap();
    assert_ne!(fid_a, fid_b);

    // 後から登録したファイルの位置は必ず大きい
    let end_a = sm.end_loc(fid_a);
    let start_b = sm.start_loc(fid_b);
    assert!(end_a.raw_encoding() < start_b.raw_encoding());

    // 各位置は自分のファイルにだけ解決される
    let in_a = sm.loc_for_file_offset(fid_a, 2);
    let in_b = sm.loc_for_file_offset(fid_b, 2);
    assert_eq!(sm.file_id(in_a), fid_a);
    assert_eq!(sm.file_id(in_b), fid_b);
    assert!(sm.is_before_in_source_order(in_a, in_b));
}

#[test]
fn source_text_and_length() {
    let fixture = Fixture::new();
    let path = fixture.write_file("d.lm", b"hello world");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    let begin = sm.loc_for_file_offset(fid, 0);
    let end = sm.loc_for_file_offset(fid, 5);
    assert_eq!(sm.source_text(SourceRange::new(begin, end)), "hello");
    assert_eq!(sm.source_length(begin, end), 5);

    // 逆順は空・0
    assert_eq!(sm.source_text(SourceRange::new(end, begin)), "");
    assert_eq!(sm.source_length(end, begin), 0);
}

#[test]
fn cross_file_range_yields_empty_text() {
    let fixture = Fixture::new();
    let path_a = fixture.write_file("a.lm", b"aaaa");
    let path_b = fixture.write_file("b.lm", b"bbbb");
    let sm = &fixture.source_manager;

    let fid_a = sm.create_file(&path_a).unwrap();
    let fid_b = sm.create_file(&path_b).unwrap();

    let begin = sm.loc_for_file_offset(fid_a, 0);
    let end = sm.loc_for_file_offset(fid_b, 2);
    assert_eq!(sm.source_text(SourceRange::new(begin, end)), "");
    assert_eq!(sm.source_length(begin, end), 0);
}

#[test]
fn invalid_locations_resolve_to_defaults() {
    let fixture = Fixture::new();
    let sm = &fixture.source_manager;

    let invalid = SourceLocation::invalid();
    assert!(sm.file_id(invalid).is_invalid());
    assert_eq!(sm.file_offset(invalid), 0);
    assert_eq!(sm.line_and_column(invalid), (0, 0));
    assert!(!sm.is_valid_location(invalid));
    assert!(sm.advance_loc(invalid, 1).is_invalid());
    assert!(!sm.filename(invalid).is_valid());

    // どのファイルにも属さない生値も拒否される
    let stray = SourceLocation::from_raw_encoding(0xFFFF_0000);
    assert!(sm.file_id(stray).is_invalid());
}

#[test]
fn advance_loc_stays_within_file() {
    let fixture = Fixture::new();
    let path = fixture.write_file("e.lm", b"0123456789");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    let start = sm.start_loc(fid);
    let mid = sm.advance_loc(start, 4);
    assert_eq!(sm.file_offset(mid), 4);

    // ファイル終端まではちょうど進める
    let end = sm.advance_loc(start, 10);
    assert_eq!(end, sm.end_loc(fid));

    // 終端を越えると無効
    assert!(sm.advance_loc(start, 11).is_invalid());
}

#[test]
fn character_data_matches_file_contents() {
    let fixture = Fixture::new();
    let path = fixture.write_file("f.lm", b"hello");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    let loc = sm.loc_for_file_offset(fid, 1);
    let data = sm.character_data(loc).unwrap();
    assert_eq!(&data[..4], b"ello");

    // ファイル終端位置にはデータがない
    assert!(sm.character_data(sm.end_loc(fid)).is_none());
}

#[test]
fn full_loc_provides_context() {
    let fixture = Fixture::new();
    let path = fixture.write_file("g.lm", b"x\ny");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    let loc = sm.loc_for_file_offset(fid, 2);
    let full = sm.full_loc(loc);
    assert!(full.is_valid());
    assert_eq!(full.file_id(), fid);
    assert_eq!(full.file_offset(), 2);
    assert_eq!(full.line_number(), 2);
    assert_eq!(full.column_number(), 1);
    assert!(full
        .filename()
        .to_string_lossy()
        .ends_with("g.lm"));
}

#[test]
fn clear_cache_keeps_resolution_correct() {
    let fixture = Fixture::new();
    let path = fixture.write_file("h.lm", b"a\nb\nc");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    let loc = sm.loc_for_file_offset(fid, 4);
    assert_eq!(sm.line_and_column(loc), (3, 1));
    let computed_before = sm.stats().line_computation_count;

    sm.clear_cache();

    // 行インデックスは再構築され、結果は変わらない
    assert_eq!(sm.line_and_column(loc), (3, 1));
    assert!(sm.stats().line_computation_count > computed_before);
}

#[test]
fn line_index_is_computed_once_per_file() {
    let fixture = Fixture::new();
    let path = fixture.write_file("i.lm", b"a\nb\nc\nd");
    let sm = &fixture.source_manager;
    let fid = sm.create_file(&path).unwrap();

    for offset in 0..7u32 {
        let _ = sm.line_and_column(sm.loc_for_file_offset(fid, offset));
    }
    assert_eq!(sm.stats().line_computation_count, 1);
}

#[test]
fn missing_file_surfaces_error() {
    let fixture = Fixture::new();
    let sm = &fixture.source_manager;
    let result = sm.create_file(fixture.dir_path.join("absent.lm"));
    assert!(result.is_err());
}

#[test]
fn stats_track_loaded_sources() {
    let fixture = Fixture::new();
    let path_a = fixture.write_file("a.lm", b"aaaa");
    let path_b = fixture.write_file("b.lm", b"bb");
    let sm = &fixture.source_manager;

    sm.create_file(&path_a).unwrap();
    sm.create_file(&path_b).unwrap();
    sm.create_file(&path_a).unwrap(); // 再登録は数えない

    let stats = sm.stats();
    assert_eq!(stats.file_load_count, 2);
    assert_eq!(stats.source_size, 6);
}

#[test]
fn concurrent_reads_resolve_consistently() {
    let fixture = Fixture::new();
    let mut contents = Vec::new();
    for i in 0..100 {
        contents.extend_from_slice(format!("line {}\n", i).as_bytes());
    }
    let path = fixture.write_file("big.lm", &contents);
    let sm = Arc::clone(&fixture.source_manager);
    let fid = sm.create_file(&path).unwrap();
    let size = sm.file_entry(fid).unwrap().size() as u32;

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let sm = Arc::clone(&sm);
        handles.push(std::thread::spawn(move || {
            for offset in (t..size).step_by(7) {
                let loc = sm.loc_for_file_offset(fid, offset);
                assert_eq!(sm.file_offset(loc), offset);
                let (line, column) = sm.line_and_column(loc);
                assert!(line >= 1);
                assert!(column >= 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
