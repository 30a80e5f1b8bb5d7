mod common;

use std::cell::Cell as Counter;
use std::rc::Rc;
use std::sync::mpsc;

use atlasterm_core::config::Antialiasing;
use atlasterm_core::{CellRect, HostEvent, RgbColor, Theme, U16x2};
use atlasterm_render::{
    AtlasEngine, BackendError, Brushes, CellFlags, CursorOptions, EngineOptions, FramePhase,
    Invalidations, RenderBackend, RenderError, SoftwareBackend,
};

use common::{clusters, engine, mock_font, MockFonts};

fn frame(engine: &mut AtlasEngine<SoftwareBackend, MockFonts>, lines: &[&str]) {
    engine.start_paint().expect("start paint");
    for (y, line) in lines.iter().enumerate() {
        engine
            .paint_buffer_line(&clusters(line), 0, y as u16)
            .expect("paint line");
    }
    engine.present().expect("present");
}

#[test]
fn cell_count_is_viewport_divided_by_cell_size() {
    let mut engine = engine();
    assert_eq!(engine.font_size(), U16x2::new(8, 16));
    assert_eq!(engine.cell_count(), U16x2::new(100, 25));

    engine.start_paint().expect("start paint");
    assert_eq!(engine.grid().len(), 100 * 25);
    assert_eq!(engine.dirty_area(), CellRect::new(0, 0, 100, 25));
    assert_eq!(
        engine.built_size(),
        Some((U16x2::new(800, 400), U16x2::new(100, 25)))
    );

    engine.present().expect("present");
    engine.set_window_size(U16x2::new(805, 250));
    engine.start_paint().expect("start paint");
    assert_eq!(engine.cell_count(), U16x2::new(100, 15));
    assert_eq!(engine.grid().len(), 100 * 15);
}

#[test]
fn same_line_allocates_once_across_frames() {
    let mut engine = engine();

    frame(&mut engine, &["A"]);
    let first = engine.atlas_stats().expect("atlas");
    assert_eq!(first.slots_allocated, 1);
    assert_eq!(first.misses, 1);
    assert_eq!(engine.fonts_mut().rasterized, vec!["A".to_string()]);

    frame(&mut engine, &["A"]);
    let second = engine.atlas_stats().expect("atlas");
    assert_eq!(second.slots_allocated, 1);
    assert_eq!(second.hits, 1);
    assert_eq!(engine.fonts_mut().rasterized.len(), 1);
    // Cursor plus one glyph cell.
    assert_eq!(engine.backend().stats().atlas_writes, 2);
}

#[test]
fn failed_rasterization_keeps_glyphs_queued_for_next_frame() {
    let mut engine = engine();
    engine.fonts_mut().fail_rasterize = 1;

    engine.start_paint().expect("start paint");
    engine
        .paint_buffer_line(&clusters("AB"), 0, 0)
        .expect("paint line");
    let err = engine.present().expect_err("rasterize fails");
    assert!(matches!(err, RenderError::Font(_)));
    assert!(!err.is_retry());
    assert!(engine.fonts_mut().rasterized.is_empty());

    frame(&mut engine, &["AB"]);
    assert_eq!(
        engine.fonts_mut().rasterized,
        vec!["A".to_string(), "B".to_string()]
    );
    let stats = engine.atlas_stats().expect("atlas");
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 2);

    let b = engine.grid().get(1, 0).expect("cell").glyph_slot();
    assert_ne!(b, U16x2::ZERO);
    assert_eq!(
        engine.backend().atlas_alpha(b.x as u32, b.y as u32 + 8),
        Some(255)
    );

    frame(&mut engine, &["AB"]);
    assert_eq!(engine.fonts_mut().rasterized.len(), 2);
}

#[test]
fn wide_cluster_with_mark_fills_its_columns_from_one_run() {
    let mut engine = engine();
    frame(&mut engine, &["漢\u{301}"]);

    let stats = engine.atlas_stats().expect("atlas");
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.slots_allocated, 2);
    assert_eq!(engine.fonts_mut().rasterized, vec!["漢\u{301}".to_string()]);

    let grid = engine.grid();
    let left = grid.get(0, 0).expect("cell").glyph_slot();
    let right = grid.get(1, 0).expect("cell").glyph_slot();
    assert_ne!(left, right);
    assert_ne!(left, U16x2::ZERO);
    assert_eq!(grid.get(2, 0).expect("cell").glyph_slot(), U16x2::ZERO);
}

#[test]
fn attributes_select_distinct_atlas_entries() {
    let mut engine = engine();
    frame(&mut engine, &["A"]);

    let theme = Theme::default();
    engine.update_drawing_brushes(
        &Brushes {
            foreground: theme.foreground.pack(),
            background: theme.background.pack(),
            bold: true,
            italic: false,
            background_is_default: true,
        },
        false,
    );
    frame(&mut engine, &["A"]);
    let stats = engine.atlas_stats().expect("atlas");
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.slots_allocated, 2);
}

#[test]
fn device_loss_during_present_asks_for_retry() {
    let mut engine = engine();
    frame(&mut engine, &["A"]);

    engine.backend_mut().simulate_device_loss();
    engine.start_paint().expect("start paint");
    engine
        .paint_buffer_line(&clusters("A"), 0, 0)
        .expect("paint line");
    let err = engine.present().expect_err("device lost");

    assert!(err.is_retry());
    assert!(engine.invalidations().contains(Invalidations::DEVICE));
    assert!(!engine.has_device_resources());
    assert!(!engine.has_size_resources());
    assert!(!engine.has_font_resources());
    assert!(engine.atlas_stats().is_none());
    assert!(engine.grid().is_empty());
    assert!(!engine.backend().has_device());
    assert_eq!(engine.phase(), FramePhase::Idle);

    frame(&mut engine, &["A"]);
    assert_eq!(engine.stats().device_losses, 1);
    assert_eq!(engine.backend().stats().devices_created, 2);
    // New generation: the glyph is allocated and drawn again.
    assert_eq!(engine.atlas_stats().expect("atlas").slots_allocated, 1);
    assert_eq!(engine.fonts_mut().rasterized.len(), 2);
}

#[test]
fn rebuilds_clear_bits_in_dependency_order() {
    let mut engine = engine();
    assert_eq!(
        engine.invalidations(),
        Invalidations::DEVICE | Invalidations::SIZE | Invalidations::FONT | Invalidations::CONSTANTS
    );

    engine.start_paint().expect("start paint");
    assert!(
        engine.has_device_resources()
            && engine.has_size_resources()
            && engine.has_font_resources()
    );
    // Constants are uploaded at present.
    assert_eq!(engine.invalidations(), Invalidations::CONSTANTS);
    engine.present().expect("present");
    assert!(engine.invalidations().is_empty());

    engine.update_dpi(144);
    assert_eq!(engine.invalidations(), Invalidations::FONT);
    engine.update_dpi(144);
    engine.start_paint().expect("start paint");
    assert_eq!(engine.invalidations(), Invalidations::CONSTANTS);
    engine.present().expect("present");

    engine.set_window_size(U16x2::new(800, 400));
    assert!(engine.invalidations().is_empty());
    engine.set_window_size(U16x2::new(0, 400));
    assert!(engine.invalidations().is_empty());
    engine.set_window_size(U16x2::new(640, 480));
    assert_eq!(engine.invalidations(), Invalidations::SIZE);
}

#[test]
fn update_font_raises_size_only_when_cells_change() {
    let mut engine = engine();
    frame(&mut engine, &[]);

    engine.update_font(&mock_font()).expect("same font");
    assert_eq!(engine.invalidations(), Invalidations::FONT);

    let mut larger = mock_font();
    larger.size = 24.0;
    let info = engine.update_font(&larger).expect("larger font");
    assert_eq!(info.cell_size, U16x2::new(16, 32));
    assert_eq!(engine.invalidations(), Invalidations::FONT | Invalidations::SIZE);
    assert_eq!(engine.cell_count(), U16x2::new(50, 12));

    let proposed = engine.proposed_font(&mock_font(), 192).expect("proposed");
    assert_eq!(proposed.cell_size, U16x2::new(16, 32));
    assert_eq!(engine.font_size(), U16x2::new(16, 32));
}

#[test]
fn bold_formats_use_bold_weight() {
    let mut engine = engine();
    frame(&mut engine, &[]);
    let weights: Vec<(u16, bool)> = engine
        .fonts_mut()
        .requests
        .iter()
        .skip(1)
        .map(|r| (r.weight, r.italic))
        .collect();
    assert_eq!(weights, vec![(400, false), (700, false), (400, true), (700, true)]);
}

#[test]
fn selection_and_cursor_set_flags() {
    let mut engine = engine();
    engine.start_paint().expect("start paint");
    engine
        .paint_buffer_line(&clusters("hello"), 0, 0)
        .expect("paint line");
    engine.paint_selection(CellRect::new(1, 0, 3, 2));
    engine.paint_cursor(CursorOptions {
        x: 99,
        y: 0,
        visible: true,
        double_width: true,
    });
    engine.paint_cursor(CursorOptions {
        x: 99,
        y: 24,
        visible: true,
        double_width: true,
    });
    engine.paint_cursor(CursorOptions {
        x: 5,
        y: 5,
        visible: false,
        double_width: false,
    });

    let grid = engine.grid();
    let flags = |x, y| grid.get(x, y).expect("cell").flags();
    assert_eq!(flags(0, 0), CellFlags::empty());
    assert_eq!(flags(1, 0), CellFlags::SELECTED);
    assert_eq!(flags(2, 1), CellFlags::SELECTED);
    assert_eq!(flags(3, 0), CellFlags::empty());
    assert_eq!(flags(99, 0), CellFlags::CURSOR);
    // Double-width cursor continues linearly into the next row.
    assert_eq!(flags(0, 1), CellFlags::CURSOR);
    assert_eq!(flags(99, 24), CellFlags::CURSOR);
    assert_eq!(flags(5, 5), CellFlags::empty());
    engine.present().expect("present");
}

#[test]
fn constants_follow_selection_and_default_background() {
    let mut engine = engine();
    frame(&mut engine, &[]);
    let constants = engine.backend().constants().expect("constants");
    assert_eq!(constants.viewport, [0.0, 0.0, 800.0, 400.0]);
    assert_eq!(constants.cell_size, [8, 16]);
    assert_eq!(constants.cell_count_x, 100);

    engine.set_selection_background(0x0030_2010, 0.5);
    assert_eq!(engine.invalidations(), Invalidations::CONSTANTS);
    frame(&mut engine, &[]);
    assert_eq!(
        engine.backend().constants().expect("constants").selection,
        0x8030_2010
    );

    engine.set_selection_background(0x0030_2010, 0.5);
    assert!(engine.invalidations().is_empty());

    let background = RgbColor::new(1, 2, 3).pack();
    engine.update_drawing_brushes(
        &Brushes {
            foreground: 0,
            background,
            bold: false,
            italic: false,
            background_is_default: true,
        },
        true,
    );
    assert_eq!(engine.invalidations(), Invalidations::CONSTANTS);
    frame(&mut engine, &[]);
    assert_eq!(engine.backend().constants().expect("constants").background, background);
}

#[test]
fn presented_frame_shows_glyph_in_foreground() {
    let mut engine = engine();
    frame(&mut engine, &["A"]);

    let theme = Theme::default();
    let fg = theme.foreground;
    let bg = theme.background;
    let framebuffer = engine.backend().framebuffer().expect("framebuffer");
    assert_eq!(framebuffer.width(), 800);
    assert_eq!(framebuffer.pixel(3, 5), Some([fg.r, fg.g, fg.b, 255]));
    assert_eq!(framebuffer.pixel(3, 0), Some([bg.r, bg.g, bg.b, 255]));
}

#[test]
fn cursor_cell_draws_cursor_bar() {
    let mut engine = engine();
    engine.start_paint().expect("start paint");
    engine
        .paint_buffer_line(&clusters(" "), 0, 0)
        .expect("paint line");
    engine.paint_cursor(CursorOptions {
        x: 0,
        y: 0,
        visible: true,
        double_width: false,
    });
    engine.present().expect("present");

    let fg = Theme::default().foreground;
    let framebuffer = engine.backend().framebuffer().expect("framebuffer");
    // The bar covers the bottom rows of the cell only.
    assert_eq!(framebuffer.pixel(0, 15), Some([fg.r, fg.g, fg.b, 255]));
    assert_eq!(engine.backend().atlas_alpha(0, 15), Some(255));
    assert_eq!(engine.backend().atlas_alpha(0, 0), Some(0));
}

#[test]
fn host_notifications_and_recreated_callback() {
    let mut engine = engine();
    let (tx, rx) = mpsc::channel();
    engine.set_host_notifier(tx);

    let calls = Rc::new(Counter::new(0));
    let seen = Rc::clone(&calls);
    engine.set_resources_recreated_callback(move || {
        seen.set(seen.get() + 1);
        anyhow::bail!("host surface not ready")
    });

    engine.invalidate_title();
    engine.start_paint().expect("callback failure is swallowed");
    assert_eq!(calls.get(), 1);
    assert_eq!(rx.try_recv().expect("title"), HostEvent::TitleChanged);
    assert_eq!(rx.try_recv().expect("surface"), HostEvent::SurfaceRecreated);
    assert!(!engine.invalidations().contains(Invalidations::TITLE));
    engine.present().expect("present");
}

#[test]
fn device_creation_failure_is_fatal_not_retry() {
    let mut engine = engine();
    engine.backend_mut().fail_next_device_creation();
    let err = engine.start_paint().expect_err("creation fails");
    assert!(!err.is_retry());
    assert!(matches!(
        err,
        RenderError::Backend(BackendError::Creation { .. })
    ));
    assert!(engine.invalidations().contains(Invalidations::DEVICE));

    engine.start_paint().expect("second attempt succeeds");
    engine.present().expect("present");
}

#[test]
fn font_failure_keeps_font_invalid() {
    let mut engine = engine();
    let mut missing = mock_font();
    missing.family = "Missing".into();
    assert!(matches!(
        engine.update_font(&missing),
        Err(RenderError::Font(_))
    ));
    assert_eq!(engine.font_size(), U16x2::new(8, 16));
}

#[test]
fn surface_handle_creates_device_on_demand() {
    let mut engine = engine();
    assert!(!engine.has_device_resources());
    let handle = engine.surface_handle().expect("handle");
    assert_eq!(handle, Some(1));
    assert!(engine.has_device_resources());
    assert!(engine.invalidations().contains(Invalidations::SIZE));
}

#[test]
fn queries_convert_between_pixels_and_cells() {
    let mut engine = engine();
    assert_eq!(engine.scaling(), 1.0);
    assert_eq!(
        engine.viewport_in_characters(CellRect::new(16, 32, 800, 400)),
        CellRect::new(2, 2, 100, 25)
    );
    assert_eq!(
        engine.viewport_in_pixels(CellRect::new(1, 1, 3, 2)),
        CellRect::new(8, 16, 24, 32)
    );
    assert!(engine.is_glyph_wide_by_font("漢").expect("measure"));
    assert!(!engine.is_glyph_wide_by_font("a").expect("measure"));
}

#[test]
fn antialiasing_change_rebuilds_font_resources() {
    let mut engine = engine();
    frame(&mut engine, &["A"]);
    engine.set_antialiasing_mode(Antialiasing::Aliased);
    assert_eq!(engine.invalidations(), Invalidations::FONT);
    frame(&mut engine, &["A"]);
    // Fresh generation: the glyph is drawn again.
    assert_eq!(engine.fonts_mut().rasterized.len(), 2);
    let last = engine.fonts_mut().requests.last().cloned().expect("request");
    assert_eq!(last.antialiasing, Antialiasing::Aliased);
}

#[test]
fn wait_falls_back_to_sleep() {
    let mut engine = AtlasEngine::new(
        SoftwareBackend::new(),
        MockFonts::default(),
        EngineOptions {
            pacing_fallback: std::time::Duration::from_millis(1),
            ..EngineOptions::default()
        },
    );
    let started = std::time::Instant::now();
    engine.wait_until_can_render();
    assert!(started.elapsed() >= std::time::Duration::from_millis(1));
}

#[test]
#[should_panic(expected = "cell size is zero")]
fn painting_without_font_is_a_contract_violation() {
    let mut engine = AtlasEngine::new(
        SoftwareBackend::new(),
        MockFonts::default(),
        EngineOptions::default(),
    );
    engine.set_window_size(U16x2::new(800, 400));
    let _ = engine.start_paint();
}
