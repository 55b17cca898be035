//! zenpng CLI - rate-distortion optimized lossy PNG/QOI/LZ4 recompression

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use zenpng::{
    color, encode_with_params, lz4i, png, qoi, ErrorMetric, Image, OutputFormat, RdoParams,
    SpeedMode,
};

/// Rate-distortion optimized lossy recompressor for PNG, QOI and LZ4
/// image containers
///
/// Re-encodes an image so that its pixels compress dramatically better in
/// the chosen container, with perceptually masked error bounded by hard
/// reject thresholds. Quality vs size is a single knob: --lambda.
#[derive(Parser, Debug)]
#[command(name = "zenpng")]
#[command(version, about)]
struct Cli {
    /// Input image (png/bmp/tga/jpg)
    input: PathBuf,

    /// Output file; derived from the input name when omitted
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Emit the fixed-opcode byte-stream container (QOI)
    #[arg(long, conflicts_with_all = ["lz4i", "unpack"])]
    qoi: bool,

    /// Emit the LZ4-framed raw-pixel container
    #[arg(long, conflicts_with = "unpack")]
    lz4i: bool,

    /// Decode an LZ4-framed container back to a PNG
    #[arg(long)]
    unpack: bool,

    /// After a QOI encode, also write the decoded pixels as a PNG
    #[arg(long)]
    unpack_qoi_to_png: bool,

    /// Rate-distortion weight in [0, 250000]; higher = smaller files
    #[arg(long, default_value_t = 300.0)]
    lambda: f32,

    /// PNG parsing level in [0, 29]; higher = slower, better compression
    #[arg(long, default_value_t = 0)]
    level: usize,

    /// Two-pass PNG encoding for noticeably higher compression
    #[arg(long)]
    two_pass: bool,

    /// Linear RGB(A) metrics instead of perceptual OkLab
    #[arg(long)]
    linear: bool,

    /// Angular error metric for normal maps
    #[arg(long)]
    normal_map: bool,

    /// Normal-map channels are snorm8 rather than unorm8
    #[arg(long)]
    snorm: bool,

    /// Re-project source normals to the closest encodable unit vector
    #[arg(long)]
    normalize: bool,

    /// Disable all candidate rejection
    #[arg(long)]
    no_reject: bool,

    /// OkLab lightness reject threshold in [0, 1]
    #[arg(long, value_name = "F")]
    rl: Option<f32>,

    /// OkLab chroma distance reject threshold in [0, 1]
    #[arg(long, value_name = "F")]
    rlab: Option<f32>,

    /// RGB reject threshold in [0, 256] (linear mode)
    #[arg(long, value_name = "N")]
    rrgb: Option<u32>,

    /// Red reject threshold (linear mode)
    #[arg(long, value_name = "N")]
    rr: Option<u32>,

    /// Green reject threshold (linear mode)
    #[arg(long, value_name = "N")]
    rg: Option<u32>,

    /// Blue reject threshold (linear mode)
    #[arg(long, value_name = "N")]
    rb: Option<u32>,

    /// Alpha reject threshold
    #[arg(long, value_name = "N")]
    ra: Option<u32>,

    /// Red channel weight in [0, 256] (linear mode)
    #[arg(long, value_name = "N")]
    wr: Option<u32>,

    /// Green channel weight (linear mode)
    #[arg(long, value_name = "N")]
    wg: Option<u32>,

    /// Blue channel weight (linear mode)
    #[arg(long, value_name = "N")]
    wb: Option<u32>,

    /// Alpha channel weight (linear mode)
    #[arg(long, value_name = "N")]
    wa: Option<u32>,

    /// OkLab L a b alpha weights; L a b are renormalized to unit length
    #[arg(long, num_args = 4, value_names = ["L", "A", "B", "ALPHA"])]
    wlab: Option<Vec<f32>>,

    /// Full QOI/LZ4 searches
    #[arg(long, conflicts_with_all = ["better", "fastest"])]
    uber: bool,

    /// Reduced QOI/LZ4 searches (default)
    #[arg(long, conflicts_with = "fastest")]
    better: bool,

    /// Lossless-only QOI/LZ4 fast paths
    #[arg(long)]
    fastest: bool,

    /// Disable the perceptual masking map entirely
    #[arg(long)]
    no_mse_scaling: bool,

    /// Std-dev at which a region stops counting as smooth
    #[arg(long, value_name = "F")]
    max_smooth_std_dev: Option<f32>,

    /// MSE scale ceiling for smooth regions
    #[arg(long, value_name = "F")]
    smooth_max_mse_scale: Option<f32>,

    /// Std-dev at which a region stops counting as ultra-smooth
    #[arg(long, value_name = "F")]
    max_ultra_smooth_std_dev: Option<f32>,

    /// MSE scale ceiling for ultra-smooth regions
    #[arg(long, value_name = "F")]
    ultra_smooth_max_mse_scale: Option<f32>,

    /// Never let fully opaque pixels turn transparent or vice versa
    #[arg(long)]
    rt: bool,

    /// Alpha is data, not coverage: skip the alpha-edge quality boost
    #[arg(long)]
    no_alpha_opacity: bool,

    /// Only try LZ matches, never cheaper-to-code literals
    #[arg(long)]
    match_only: bool,

    /// Print debug output (code tables, histograms)
    #[arg(long)]
    debug: bool,

    /// Suppress all stdout output
    #[arg(long)]
    quiet: bool,

    /// Suppress the per-scanline progress display
    #[arg(long)]
    no_progress: bool,

    /// Compute the OkLab table at startup instead of caching it on disk
    #[arg(long)]
    no_cache: bool,
}

fn build_params(cli: &Cli) -> RdoParams {
    let mut p = RdoParams {
        lambda: cli.lambda.clamp(0.0, 250_000.0),
        level: cli.level.min(29),
        two_pass: cli.two_pass,
        transparent_reject_test: cli.rt,
        alpha_is_opacity: !cli.no_alpha_opacity,
        match_only: cli.match_only,
        normalize: cli.normalize,
        snorm: cli.snorm,
        no_mse_scaling: cli.no_mse_scaling,
        print_stats: !cli.quiet,
        print_progress: !cli.quiet && !cli.no_progress,
        print_debug_output: cli.debug,
        ..Default::default()
    };

    p.format = if cli.qoi {
        OutputFormat::Qoi
    } else if cli.lz4i {
        OutputFormat::Lz4i
    } else {
        OutputFormat::Png
    };

    p.speed_mode = if cli.uber {
        SpeedMode::Uber
    } else if cli.fastest {
        SpeedMode::Fastest
    } else {
        SpeedMode::Better
    };

    if cli.normal_map || cli.snorm {
        p.metric = ErrorMetric::NormalMap;
        p.reject_thresholds[0] = 20;
        p.reject_thresholds[1] = 20;
        p.reject_thresholds[2] = 20;
    } else if cli.linear {
        p.metric = ErrorMetric::Linear;
    }

    if cli.no_reject {
        p.reject_thresholds = [256; 4];
        p.use_reject_thresholds = false;
    }
    if let Some(v) = cli.rrgb {
        let v = v.min(256);
        p.reject_thresholds[0] = v;
        p.reject_thresholds[1] = v;
        p.reject_thresholds[2] = v;
        p.use_reject_thresholds = true;
    }
    for (opt, idx) in [(cli.rr, 0usize), (cli.rg, 1), (cli.rb, 2), (cli.ra, 3)] {
        if let Some(v) = opt {
            p.reject_thresholds[idx] = v.min(256);
            p.use_reject_thresholds = true;
        }
    }
    if let Some(v) = cli.rl {
        p.reject_thresholds_lab[0] = v.clamp(0.0, 1.0);
        p.use_reject_thresholds = true;
    }
    if let Some(v) = cli.rlab {
        p.reject_thresholds_lab[1] = v.clamp(0.0, 1.0);
        p.use_reject_thresholds = true;
    }

    for (opt, idx) in [(cli.wr, 0usize), (cli.wg, 1), (cli.wb, 2), (cli.wa, 3)] {
        if let Some(v) = opt {
            p.chan_weights[idx] = v.min(256);
            p.use_chan_weights = true;
        }
    }
    if let Some(w) = &cli.wlab {
        let (mut l, mut a, mut b) = (
            w[0].clamp(0.0, 100.0),
            w[1].clamp(0.0, 100.0),
            w[2].clamp(0.0, 100.0),
        );
        let len = (l * l + a * a + b * b).sqrt();
        if len > 0.0 {
            l /= len;
            a /= len;
            b /= len;
        }
        p.chan_weights_lab = [l, a, b, w[3].clamp(0.0, 100.0)];
    }

    if let Some(v) = cli.max_smooth_std_dev {
        p.max_smooth_std_dev = v;
    }
    p.smooth_max_mse_scale = cli.smooth_max_mse_scale;
    if let Some(v) = cli.max_ultra_smooth_std_dev {
        p.max_ultra_smooth_std_dev = v;
    }
    p.ultra_smooth_max_mse_scale = cli.ultra_smooth_max_mse_scale;

    p
}

fn derived_output(input: &Path, unpack: bool, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "out".to_string());

    let name = if unpack {
        format!("{}.png", stem)
    } else {
        format!("{}_rdo.{}", stem, format.extension())
    };
    input.with_file_name(name)
}

fn load_image(path: &Path) -> zenpng::Result<Image> {
    let decoded = image::open(path)?;
    let has_alpha = decoded.color().has_alpha();
    let (w, h) = (decoded.width() as usize, decoded.height() as usize);
    if has_alpha {
        Image::from_rgba8(decoded.to_rgba8().as_raw(), w, h)
    } else {
        Image::from_rgb8(decoded.to_rgb8().as_raw(), w, h)
    }
}

fn run(cli: &Cli) -> zenpng::Result<()> {
    let params = build_params(cli);

    if cli.unpack {
        let data = std::fs::read(&cli.input)?;
        let img = lz4i::decode(&data)?;
        let out_path = cli
            .output
            .clone()
            .unwrap_or_else(|| derived_output(&cli.input, true, params.format));
        std::fs::write(&out_path, png::write_lossless(&img))?;
        if !cli.quiet {
            println!(
                "Unpacked {}x{} image to \"{}\"",
                img.width(),
                img.height(),
                out_path.display()
            );
        }
        return Ok(());
    }

    let cache_dir = if cli.no_cache {
        None
    } else {
        std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
    };
    color::init_oklab_table(cache_dir.as_deref(), cli.quiet)?;

    let input_size = std::fs::metadata(&cli.input)?.len();
    let img = load_image(&cli.input)?;

    if !cli.quiet {
        println!(
            "Loaded file \"{}\", {}x{}, has alpha: {}, size: {}, bpp: {:.3}",
            cli.input.display(),
            img.width(),
            img.height(),
            img.has_alpha() as u8,
            input_size,
            (input_size as f32 * 8.0) / img.total_pixels() as f32
        );
    }

    let start = Instant::now();
    let out = encode_with_params(&img, &params)?;
    if !cli.quiet {
        println!("Encoded in {:.3} secs", start.elapsed().as_secs_f32());
    }

    let out_path = cli
        .output
        .clone()
        .unwrap_or_else(|| derived_output(&cli.input, false, params.format));
    std::fs::write(&out_path, &out.data)?;
    if !cli.quiet {
        println!("Wrote output file \"{}\"", out_path.display());
    }

    if cli.unpack_qoi_to_png && params.format == OutputFormat::Qoi {
        let decoded = qoi::decode(&out.data)?;
        let png_path = out_path.with_extension("png");
        std::fs::write(&png_path, png::write_lossless(&decoded))?;
        if !cli.quiet {
            println!("Wrote decoded image \"{}\"", png_path.display());
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not failures.
            use clap::error::ErrorKind;
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("zenpng: {}", e);
            ExitCode::FAILURE
        }
    }
}
