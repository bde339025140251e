use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use veriface_core::{quality, rotation};
use veriface_models::ModelRegistry;

#[derive(Parser, Debug)]
#[command(name = "veriface", version, about = "Veriface diagnostics CLI")]
struct Cli {
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,
    #[arg(
        long,
        global = true,
        env = "VERIFACE_MODEL_DIR",
        default_value = "models",
        help = "Directory containing the ONNX models"
    )]
    model_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assess a single image with the one-shot capture pipeline.
    Capture {
        image: PathBuf,
        #[arg(long, help = "Write the warped card image to this path")]
        out: Option<PathBuf>,
    },
    /// Recover the upright printed face from a card image.
    ExtractFace {
        image: PathBuf,
        #[arg(long, help = "Write the face crop to this path")]
        out: Option<PathBuf>,
    },
    /// Cosine similarity between the best faces of two images.
    Similarity { image_a: PathBuf, image_b: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Capture { ref image, ref out } => run_capture(&cli, image, out.as_deref()),
        Commands::ExtractFace { ref image, ref out } => {
            run_extract_face(&cli, image, out.as_deref())
        }
        Commands::Similarity {
            ref image_a,
            ref image_b,
        } => run_similarity(&cli, image_a, image_b),
    }
}

fn load_image(path: &std::path::Path) -> Result<image::RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8())
}

fn load_registry(cli: &Cli) -> Result<ModelRegistry> {
    let dir = &cli.model_dir;
    let path = |name: &str| dir.join(name).to_string_lossy().into_owned();
    ModelRegistry::load(&path("card.onnx"), &path("face.onnx"), &path("arcface.onnx"))
        .context("failed to load models")
}

fn run_capture(cli: &Cli, image: &std::path::Path, out: Option<&std::path::Path>) -> Result<()> {
    let frame = load_image(image)?;
    let Some(capture) = quality::assess(&frame) else {
        bail!("no card-shaped quadrilateral found");
    };

    if let Some(out) = out {
        capture
            .warped
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "ready": capture.quad.ready,
                "feedback": capture.quad.feedback,
                "coverage": capture.quad.coverage,
                "brightness": capture.quad.brightness,
                "sharpness": capture.quad.sharpness,
            })
        );
    } else {
        println!("ready:      {}", capture.quad.ready);
        println!("coverage:   {:.3}", capture.quad.coverage);
        println!("brightness: {:.1}", capture.quad.brightness);
        println!("sharpness:  {:.1}", capture.quad.sharpness);
        for line in &capture.quad.feedback {
            println!("feedback:   {line}");
        }
    }
    Ok(())
}

fn run_extract_face(
    cli: &Cli,
    image: &std::path::Path,
    out: Option<&std::path::Path>,
) -> Result<()> {
    let card = load_image(image)?;
    let registry = load_registry(cli)?;
    let collab = registry.collaborators();

    let extracted = rotation::extract_card_face(&card, collab.faces.as_ref())
        .context("face extraction failed")?;

    if let Some(out) = out {
        extracted
            .crop
            .save(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "angle": extracted.angle,
                "confidence": extracted.bbox.confidence,
                "bbox": extracted.bbox.as_array(),
                "area_ratio": extracted.bbox.area_ratio,
            })
        );
    } else {
        println!("rotation:   {}°", extracted.angle);
        println!("confidence: {:.3}", extracted.bbox.confidence);
        println!("bbox:       {:?}", extracted.bbox.as_array());
    }
    Ok(())
}

fn run_similarity(cli: &Cli, image_a: &std::path::Path, image_b: &std::path::Path) -> Result<()> {
    let a = load_image(image_a)?;
    let b = load_image(image_b)?;
    let registry = load_registry(cli)?;
    let collab = registry.collaborators();

    let embed = |img: &image::RgbImage, label: &str| -> Result<veriface_core::Embedding> {
        rotation::embed_face(img, collab.embedder.as_ref())?
            .with_context(|| format!("no face found in {label}"))
    };
    let embedding_a = embed(&a, "first image")?;
    let embedding_b = embed(&b, "second image")?;
    let similarity = embedding_a.similarity(&embedding_b);

    if cli.json {
        println!("{}", serde_json::json!({ "similarity": similarity }));
    } else {
        println!("similarity: {similarity:.4}");
    }
    Ok(())
}
