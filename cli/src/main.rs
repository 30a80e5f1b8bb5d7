use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use atlasterm_core::{Config, U16x2};
use atlasterm_render::shaping::{shape_line, Cluster, FontRequest, FontService, ShapingScratch};
use atlasterm_render::{
    AtlasEngine, CursorOptions, DesiredFont, EngineOptions, RenderBackend, SoftwareBackend,
    SystemFonts, WgpuBackend,
};

#[derive(Debug, Parser)]
#[command(name = "atlasterm-cli", about = "Measure the atlasterm rendering core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a JSON report of shaping, atlas and frame timings
    Bench {
        #[arg(long, default_value_t = 120)]
        cols: u16,
        #[arg(long, default_value_t = 40)]
        rows: u16,
        #[arg(long, default_value_t = 200)]
        iterations: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Bench {
            cols,
            rows,
            iterations,
        } => run_bench(cols.max(1), rows.max(1), iterations.max(1)),
    }
}

fn run_bench(cols: u16, rows: u16, iterations: usize) -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    });

    let shaping = or_error("shaping_throughput", bench_shaping(&config, cols, rows, iterations));
    let software = or_error(
        "frame_software",
        bench_frames("frame_software", SoftwareBackend::new(), &config, cols, rows, iterations),
    );
    let wgpu = or_error(
        "frame_wgpu",
        bench_frames("frame_wgpu", WgpuBackend::offscreen(), &config, cols, rows, iterations),
    );

    let report = json!({
        "benchmarks": [shaping, software, wgpu],
        "params": {
            "cols": cols,
            "rows": rows,
            "iterations": iterations,
            "font": config.font.family,
        }
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn or_error(name: &str, result: Result<Value>) -> Value {
    result.unwrap_or_else(|e| {
        json!({
            "name": name,
            "error": format!("{e:#}"),
        })
    })
}

/// Line pipeline alone: font fallback, complexity split and shaping, no atlas.
fn bench_shaping(config: &Config, cols: u16, rows: u16, iterations: usize) -> Result<Value> {
    let mut fonts = system_fonts(config);
    let format = fonts
        .text_format(&FontRequest {
            family: config.font.family.clone(),
            size: config.font.size,
            weight: config.font.weight,
            italic: false,
            dpi: config.font.dpi,
            antialiasing: config.render.antialiasing,
        })
        .context("resolving font")?;
    let mut scratch = ShapingScratch::default();

    let mut total_bytes = 0usize;
    let mut total_runs = 0usize;
    let mut shaped_segments = 0usize;
    let mut replacement_runs = 0usize;
    let start = Instant::now();
    for i in 0..iterations {
        for line in generate_screen(i, cols, rows) {
            total_bytes += line.len();
            scratch.load_line(&line_clusters(&line));
            let stats = shape_line(&mut fonts, &format, &mut scratch, |_| {})?;
            total_runs += stats.runs;
            shaped_segments += stats.shaped_segments;
            replacement_runs += stats.replacement_runs;
        }
    }
    let mut metric = metric_json(
        "shaping_throughput",
        iterations,
        start.elapsed().as_secs_f64(),
        total_bytes,
        total_runs,
    );
    metric["shaped_segments"] = json!(shaped_segments);
    metric["replacement_runs"] = json!(replacement_runs);
    Ok(metric)
}

/// Full frames through the engine, split into paint stages.
fn bench_frames<B: RenderBackend>(
    name: &str,
    backend: B,
    config: &Config,
    cols: u16,
    rows: u16,
    iterations: usize,
) -> Result<Value> {
    let mut engine = AtlasEngine::new(backend, system_fonts(config), EngineOptions::from(config));
    let font = engine
        .update_font(&DesiredFont {
            family: config.font.family.clone(),
            size: config.font.size,
            weight: config.font.weight,
        })
        .context("selecting font")?;
    engine.set_window_size(U16x2::new(
        cols.saturating_mul(font.cell_size.x),
        rows.saturating_mul(font.cell_size.y),
    ));

    let mut stage_start_ms = 0.0f64;
    let mut stage_lines_ms = 0.0f64;
    let mut stage_present_ms = 0.0f64;
    let mut total_bytes = 0usize;
    let mut total_runs = 0usize;

    for i in 0..iterations {
        let screen = generate_screen(i, cols, rows);
        let lines: Vec<Vec<Cluster<'_>>> = screen.iter().map(|l| line_clusters(l)).collect();
        total_bytes += screen.iter().map(String::len).sum::<usize>();

        let t_start = Instant::now();
        engine.start_paint()?;
        stage_start_ms += t_start.elapsed().as_secs_f64() * 1000.0;

        let t_lines = Instant::now();
        for (y, line) in lines.iter().enumerate() {
            total_runs += engine.paint_buffer_line(line, 0, y as u16)?.runs;
        }
        engine.paint_cursor(CursorOptions {
            x: (i % cols as usize) as u16,
            y: rows - 1,
            visible: true,
            double_width: false,
        });
        stage_lines_ms += t_lines.elapsed().as_secs_f64() * 1000.0;

        let t_present = Instant::now();
        engine.present()?;
        stage_present_ms += t_present.elapsed().as_secs_f64() * 1000.0;
    }

    let atlas = engine.atlas_stats().unwrap_or_default();
    let lookups = atlas.hits + atlas.misses;
    let total_ms = stage_start_ms + stage_lines_ms + stage_present_ms;
    Ok(json!({
        "name": name,
        "iterations": iterations,
        "bytes": total_bytes,
        "runs": total_runs,
        "cell_size": [font.cell_size.x, font.cell_size.y],
        "avg_ms": total_ms / iterations as f64,
        "stages_ms": {
            "start_paint": stage_start_ms,
            "paint_lines": stage_lines_ms,
            "present": stage_present_ms,
        },
        "stages_avg_ms": {
            "start_paint": stage_start_ms / iterations as f64,
            "paint_lines": stage_lines_ms / iterations as f64,
            "present": stage_present_ms / iterations as f64,
        },
        "atlas": {
            "hits": atlas.hits,
            "misses": atlas.misses,
            "hit_rate": if lookups > 0 { atlas.hits as f64 / lookups as f64 } else { 0.0 },
            "glyphs": atlas.glyphs,
            "wraps": atlas.wraps,
        },
        "glyphs_rasterized": engine.stats().glyphs_rasterized,
    }))
}

fn system_fonts(config: &Config) -> SystemFonts {
    let mut fonts = SystemFonts::new();
    for path in &config.font.extra_font_files {
        if let Err(err) = fonts.load_font_file(path) {
            warn!(path = %path.display(), %err, "skipping extra font file");
        }
    }
    fonts
}

fn line_clusters(line: &str) -> Vec<Cluster<'_>> {
    line.graphemes(true)
        .map(|g| Cluster::new(g, UnicodeWidthStr::width(g).clamp(1, 2) as u16))
        .collect()
}

fn metric_json(
    name: &str,
    iterations: usize,
    elapsed_secs: f64,
    bytes: usize,
    runs: usize,
) -> Value {
    let total_ms = elapsed_secs * 1000.0;
    json!({
        "name": name,
        "iterations": iterations,
        "total_ms": total_ms,
        "avg_ms": total_ms / iterations.max(1) as f64,
        "throughput_mib_s": if elapsed_secs > 0.0 {
            (bytes as f64 / (1024.0 * 1024.0)) / elapsed_secs
        } else {
            0.0
        },
        "bytes": bytes,
        "runs": runs,
    })
}

/// One screen of `ls -l`-like output with some wide and combining text mixed in,
/// each line cut to `cols` columns.
fn generate_screen(seed: usize, cols: u16, rows: u16) -> Vec<String> {
    (0..rows as usize)
        .map(|row| {
            let n = seed * rows as usize + row;
            let line = match n % 7 {
                3 => format!(
                    "{:>5} 漢字かな混在 {:08x} résumé nai\u{308}ve",
                    n,
                    n.wrapping_mul(29)
                ),
                5 => format!("{:>5} \u{5e9}\u{5dc}\u{5d5}\u{5dd} -> {:08x}", n, n.wrapping_mul(43)),
                _ => {
                    let kind = if n % 5 == 0 { 'd' } else { '-' };
                    let month = ["Jan", "Feb", "Mar", "Apr", "May", "Jun"][n % 6];
                    format!(
                        "{kind}rw-r--r--  1 user  staff {:>8} {month} {:>2} 12:34 file_{:05}.txt",
                        1024 + (n * 37) % 2_000_000,
                        (n % 28) + 1,
                        n
                    )
                }
            };
            truncate_columns(&line, cols)
        })
        .collect()
}

fn truncate_columns(line: &str, cols: u16) -> String {
    let mut used = 0usize;
    let mut out = String::with_capacity(line.len());
    for g in line.graphemes(true) {
        used += UnicodeWidthStr::width(g).clamp(1, 2);
        if used > cols as usize {
            break;
        }
        out.push_str(g);
    }
    out
}
