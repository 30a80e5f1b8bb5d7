use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use atlasterm_core::config::BackendKind;
use atlasterm_core::{Config, U16x2};
use atlasterm_render::shaping::Cluster;
use atlasterm_render::{
    AtlasEngine, CursorOptions, DesiredFont, EngineOptions, FontService, RenderBackend,
    RenderError, SoftwareBackend, SystemFonts, WgpuBackend,
};

const SAMPLE: &str = "atlasterm glyph atlas\n\
    $ ls -la ~/projects\n\
    漢字とかなの混在テキスト\n\
    cafe\u{301} noe\u{308}l\n\
    \u{5e9}\u{5dc}\u{5d5}\u{5dd} \u{645}\u{631}\u{62d}\u{628}\u{627}\n\
    fn main() -> Result<(), Error> { Ok(()) }";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Software,
    Wgpu,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Software => BackendKind::Software,
            BackendArg::Wgpu => BackendKind::Wgpu,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "atlasterm", version, about = "Render text through the glyph-atlas engine")]
struct Args {
    /// Text file to render, one grid row per line (default: built-in sample)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    #[arg(long, default_value_t = 800)]
    width: u16,

    #[arg(long, default_value_t = 400)]
    height: u16,

    /// Write the last frame as a PPM image (software backend only)
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Report a lost device on the first present (software backend only)
    #[arg(long)]
    simulate_device_loss: bool,

    /// Config file (default: the per-user config path)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("atlasterm v{}", env!("CARGO_PKG_VERSION"));
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }),
    };

    let text = match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => SAMPLE.to_string(),
    };

    let mut fonts = SystemFonts::new();
    for path in &config.font.extra_font_files {
        if let Err(err) = fonts.load_font_file(path) {
            warn!(path = %path.display(), %err, "skipping extra font file");
        }
    }

    let options = EngineOptions::from(&config);
    match args.backend.map(BackendKind::from).unwrap_or(config.render.backend) {
        BackendKind::Software => {
            let mut engine = AtlasEngine::new(SoftwareBackend::new(), fonts, options);
            if args.simulate_device_loss {
                engine.backend_mut().simulate_device_loss();
            }
            drive(&mut engine, &config, &args, &text)?;

            if let Some(path) = &args.output {
                let framebuffer = engine
                    .backend()
                    .framebuffer()
                    .context("no frame was presented")?;
                let file = File::create(path)
                    .with_context(|| format!("creating {}", path.display()))?;
                framebuffer
                    .write_ppm(BufWriter::new(file))
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "wrote frame");
            }
        }
        BackendKind::Wgpu => {
            if args.simulate_device_loss {
                warn!("--simulate-device-loss only applies to the software backend");
            }
            let mut engine = AtlasEngine::new(WgpuBackend::offscreen(), fonts, options);
            drive(&mut engine, &config, &args, &text)?;
            if args.output.is_some() {
                warn!("--output is only supported with the software backend");
            }
        }
    }
    Ok(())
}

/// One cluster per grapheme, each at least one column wide.
fn line_clusters(line: &str) -> Vec<Cluster<'_>> {
    line.graphemes(true)
        .map(|g| {
            let columns = UnicodeWidthStr::width(g).clamp(1, u16::MAX as usize) as u16;
            Cluster::new(g, columns)
        })
        .collect()
}

/// Columns covered by `line`, saturating at `u16::MAX`.
fn line_width(line: &[Cluster<'_>]) -> u16 {
    line.iter()
        .fold(0u16, |width, cluster| width.saturating_add(cluster.columns))
}

fn drive<B, F>(
    engine: &mut AtlasEngine<B, F>,
    config: &Config,
    args: &Args,
    text: &str,
) -> Result<()>
where
    B: RenderBackend,
    F: FontService,
{
    let desired = DesiredFont {
        family: config.font.family.clone(),
        size: config.font.size,
        weight: config.font.weight,
    };
    let font = engine.update_font(&desired).context("selecting font")?;
    info!(family = %font.family, cell_size = ?font.cell_size, "font selected");
    engine.set_window_size(U16x2::new(args.width, args.height));

    let lines: Vec<Vec<Cluster<'_>>> = text.lines().map(line_clusters).collect();
    for frame in 0..args.frames {
        let mut retries = 0;
        loop {
            if frame > 0 || retries > 0 {
                engine.wait_until_can_render();
            }
            match paint_frame(engine, &lines) {
                Ok(()) => break,
                Err(err) if err.is_retry() && retries < config.render.max_frame_retries => {
                    retries += 1;
                    warn!(frame, retries, "device lost, retrying frame");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("rendering frame {frame}"));
                }
            }
        }
    }

    let stats = engine.stats();
    info!(
        frames = stats.frames_presented,
        device_losses = stats.device_losses,
        glyphs_rasterized = stats.glyphs_rasterized,
        runs = stats.shaping.runs,
        "rendering finished"
    );
    if let Some(atlas) = engine.atlas_stats() {
        info!(
            hits = atlas.hits,
            misses = atlas.misses,
            slots = atlas.slots_allocated,
            wraps = atlas.wraps,
            "atlas statistics"
        );
    }
    Ok(())
}

fn paint_frame<B, F>(
    engine: &mut AtlasEngine<B, F>,
    lines: &[Vec<Cluster<'_>>],
) -> Result<(), RenderError>
where
    B: RenderBackend,
    F: FontService,
{
    engine.start_paint()?;
    let rows = engine.cell_count().y as usize;
    for (y, line) in lines.iter().take(rows).enumerate() {
        engine.paint_buffer_line(line, 0, y as u16)?;
    }

    let visible = lines.len().min(rows);
    if visible > 0 {
        let last = &lines[visible - 1];
        engine.paint_cursor(CursorOptions {
            x: line_width(last).min(engine.cell_count().x.saturating_sub(1)),
            y: (visible - 1) as u16,
            visible: true,
            double_width: false,
        });
    }
    engine.present()
}
