mod common;

use atlasterm_render::shaping::pipeline::{MAX_SHAPING_ATTEMPTS, REPLACEMENT_CHARACTER};
use atlasterm_render::shaping::{shape_line, Cluster, ShapingScratch};
use atlasterm_render::RenderError;

use common::{clusters, mock_format, MockFonts};

/// Shape `text` and collect the emitted runs as (text, x1, x2).
fn runs(fonts: &mut MockFonts, text: &str) -> Vec<(String, u16, u16)> {
    let format = mock_format(fonts);
    let mut scratch = ShapingScratch::default();
    scratch.load_line(&clusters(text));
    let mut out = Vec::new();
    shape_line(fonts, &format, &mut scratch, |run| {
        out.push((run.text.to_string(), run.x1, run.x2));
    })
    .expect("shape line");
    out
}

#[test]
fn simple_text_is_one_run_per_character_without_shaping() {
    let mut fonts = MockFonts::default();
    let out = runs(&mut fonts, "ab漢");
    assert_eq!(
        out,
        vec![
            ("a".to_string(), 0, 1),
            ("b".to_string(), 1, 2),
            ("漢".to_string(), 2, 4),
        ]
    );
    assert!(fonts.shape_capacities.is_empty());
}

#[test]
fn wide_character_with_combining_mark_is_one_run() {
    let mut fonts = MockFonts::default();
    let out = runs(&mut fonts, "漢\u{301}x");
    assert_eq!(
        out,
        vec![("漢\u{301}".to_string(), 0, 2), ("x".to_string(), 2, 3)]
    );
    assert_eq!(fonts.shape_capacities.len(), 1);
}

#[test]
fn simple_cluster_of_several_characters_keeps_all_of_them() {
    let mut fonts = MockFonts::default();
    let format = mock_format(&mut fonts);
    let mut scratch = ShapingScratch::default();
    scratch.load_line(&[
        Cluster::new("\u{1100}\u{1161}", 2),
        Cluster::new("x", 1),
        Cluster::new("\u{1100}\u{1161}\u{11A8}", 2),
    ]);
    let mut out = Vec::new();
    shape_line(&mut fonts, &format, &mut scratch, |run| {
        out.push((run.text.to_string(), run.x1, run.x2));
    })
    .expect("shape line");
    assert_eq!(
        out,
        vec![
            ("\u{1100}\u{1161}".to_string(), 0, 2),
            ("x".to_string(), 2, 3),
            ("\u{1100}\u{1161}\u{11A8}".to_string(), 3, 5),
        ]
    );
    assert!(fonts.shape_capacities.is_empty());
}

#[test]
fn unmapped_text_becomes_one_replacement_per_cluster() {
    let mut fonts = MockFonts::default();
    let out = runs(&mut fonts, "a\u{E000}\u{E001}b");
    assert_eq!(
        out,
        vec![
            ("a".to_string(), 0, 1),
            (REPLACEMENT_CHARACTER.to_string(), 1, 2),
            (REPLACEMENT_CHARACTER.to_string(), 2, 3),
            ("b".to_string(), 3, 4),
        ]
    );
}

#[test]
fn wide_unmapped_cluster_keeps_its_columns() {
    let mut fonts = MockFonts::default();
    let format = mock_format(&mut fonts);
    let mut scratch = ShapingScratch::default();
    scratch.load_line(&[Cluster::new("\u{E000}", 2), Cluster::new("c", 1)]);
    let mut out = Vec::new();
    let stats = shape_line(&mut fonts, &format, &mut scratch, |run| {
        out.push((run.x1, run.x2));
    })
    .expect("shape line");
    assert_eq!(out, vec![(0, 2), (2, 3)]);
    assert_eq!(stats.replacement_runs, 1);
}

#[test]
fn buffer_too_small_grows_by_half_each_retry() {
    let mut fonts = MockFonts {
        fail_shaping: 3,
        ..MockFonts::default()
    };
    let format = mock_format(&mut fonts);
    let mut scratch = ShapingScratch::default();
    scratch.load_line(&clusters("e\u{301}"));
    let initial = scratch.glyph_capacity();

    let stats = shape_line(&mut fonts, &format, &mut scratch, |_| {}).expect("shape line");

    let grow = |n: usize| n + (n >> 1);
    assert_eq!(
        fonts.shape_capacities,
        vec![initial, grow(initial), grow(grow(initial)), grow(grow(grow(initial)))]
    );
    let last = *fonts.shape_capacities.last().expect("attempts") as f64;
    assert!((last - initial as f64 * 1.5f64.powi(3)).abs() < 2.0);
    assert_eq!(stats.shaping_retries, 3);
    assert_eq!(stats.runs, 1);
    assert_eq!(scratch.glyph_capacity(), grow(grow(grow(initial))));
}

#[test]
fn retries_are_bounded() {
    let mut fonts = MockFonts {
        fail_shaping: u32::MAX,
        ..MockFonts::default()
    };
    let format = mock_format(&mut fonts);
    let mut scratch = ShapingScratch::default();
    scratch.load_line(&clusters("o\u{308}"));

    let err = shape_line(&mut fonts, &format, &mut scratch, |_| {}).expect_err("exhausted");
    assert!(matches!(
        err,
        RenderError::ShapingRetriesExhausted { attempts, .. } if attempts == MAX_SHAPING_ATTEMPTS
    ));
    assert_eq!(fonts.shape_capacities.len(), MAX_SHAPING_ATTEMPTS as usize);
    assert!(!err.is_retry());
}

#[test]
fn right_to_left_text_is_shaped_and_split_at_breaks() {
    let mut fonts = MockFonts::default();
    let out = runs(&mut fonts, "\u{5e9}\u{5dc}");
    assert_eq!(
        out,
        vec![
            ("\u{5e9}".to_string(), 0, 1),
            ("\u{5dc}".to_string(), 1, 2),
        ]
    );
    assert_eq!(fonts.shape_capacities.len(), 1);
}

#[test]
fn empty_line_emits_nothing() {
    let mut fonts = MockFonts::default();
    assert!(runs(&mut fonts, "").is_empty());
}
