//! PDF Image Compressor CLI
//!
//! Command-line interface for shrinking PDFs by recompressing their images.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use compress_pdf::{
    file_ops::compress_pdf_file, CompressOptions, ImageResult, QualityTier, SkipReason,
};
use std::fs;
use std::path::PathBuf;

/// Shrink a PDF by recompressing its embedded images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    input: PathBuf,

    /// Output PDF file path [default: <input>_compressed.pdf]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JPEG quality for color images (1-100) [default: 30]
    #[arg(short, long)]
    quality: Option<u8>,

    /// JPEG quality for grayscale images (1-100, typically 40; defaults to
    /// the color quality)
    #[arg(long)]
    gray_quality: Option<u8>,

    /// Quality preset; explicit quality flags take precedence
    #[arg(short, long, value_enum)]
    tier: Option<Tier>,

    /// Maximum image width in pixels, larger images are downscaled (0 = no limit)
    #[arg(long, default_value = "1200")]
    max_width: u32,

    /// Maximum image height in pixels, larger images are downscaled (0 = no limit)
    #[arg(long, default_value = "1200")]
    max_height: u32,

    /// Minimum size reduction (percent) required to replace an image
    #[arg(long, default_value = "10")]
    min_reduction: f32,

    /// Keep the document info dictionary and XMP metadata
    #[arg(long)]
    keep_metadata: bool,

    /// Do not flate-compress content streams on save
    #[arg(long)]
    no_compress_streams: bool,

    /// Verbose output (-v for per-image info, -vv for pipeline tracing)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Tier {
    /// Color 60 / grayscale 70 - larger file, best quality
    High,
    /// Color 45 / grayscale 55 - good balance
    Balanced,
    /// Color 30 / grayscale 40 - smallest file
    Compact,
}

impl From<Tier> for QualityTier {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::High => QualityTier::High,
            Tier::Balanced => QualityTier::Balanced,
            Tier::Compact => QualityTier::Compact,
        }
    }
}

fn default_output_path(input: &PathBuf) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{}_compressed.pdf", stem))
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    let tier_qualities = args.tier.map(|t| QualityTier::from(t).qualities());
    let quality = args
        .quality
        .or(tier_qualities.map(|(color, _)| color))
        .unwrap_or(30);
    let gray_quality = args.gray_quality.or(tier_qualities.map(|(_, gray)| gray));

    let options = CompressOptions {
        quality,
        gray_quality,
        max_width: args.max_width,
        max_height: args.max_height,
        min_reduction: args.min_reduction,
        strip_metadata: !args.keep_metadata,
        compress_streams: !args.no_compress_streams,
        ..CompressOptions::default()
    };

    let output_path = args.output.clone().unwrap_or_else(|| default_output_path(&args.input));

    println!("PDF Image Compressor");
    println!("====================");
    println!(
        "Quality: color {} / grayscale {}, max dimensions {}x{}",
        options.quality,
        options.grayscale_quality(),
        options.max_width,
        options.max_height
    );

    let original_size = fs::metadata(&args.input)
        .with_context(|| format!("failed to read input file: {}", args.input.display()))?
        .len();

    let report = compress_pdf_file(&args.input, &output_path, &options)?;

    if args.verbose > 0 {
        println!();
        for image in &report.images {
            match image.outcome {
                ImageResult::Compressed { new_size } => println!(
                    "  object {} {}: {} KB -> {} KB",
                    image.object_id.0,
                    image.object_id.1,
                    image.original_size / 1024,
                    new_size / 1024
                ),
                ImageResult::Skipped(reason) => println!(
                    "  object {} {}: {} KB, unchanged ({})",
                    image.object_id.0,
                    image.object_id.1,
                    image.original_size / 1024,
                    reason
                ),
            }
        }
    }

    println!(
        "\nDone! Processed {} images: {} compressed, {} left unchanged",
        report.total_images(),
        report.compressed_images(),
        report.skipped_images()
    );
    for reason in SkipReason::ALL {
        let count = report.skip_count(reason);
        if count > 0 {
            println!("  {}: {}", reason, count);
        }
    }

    let new_size = fs::metadata(&output_path)
        .with_context(|| format!("failed to read output file: {}", output_path.display()))?
        .len();
    let saved_percent = if original_size > 0 {
        (1.0 - new_size as f64 / original_size as f64) * 100.0
    } else {
        0.0
    };
    println!(
        "{:.2} MB -> {:.2} MB ({:.1}% reduction)",
        original_size as f64 / (1024.0 * 1024.0),
        new_size as f64 / (1024.0 * 1024.0),
        saved_percent
    );
    println!("Output saved to: {}", output_path.display());

    Ok(())
}
