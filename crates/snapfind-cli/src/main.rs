use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapfind_core::{CaptionModel, Captioner, Device, ModelOptions};
use snapfind_store::{FileStore, StoredImage};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "snapfind", about = "SnapFind photo captioning CLI")]
struct Cli {
    /// Directory holding captioned images
    #[arg(long, default_value = "uploaded_images")]
    store_dir: PathBuf,
    /// Directory holding the exported ONNX caption model
    #[arg(long, default_value = "./Models")]
    model_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Caption images and save them into the store
    Caption {
        /// Image files (.jpg, .jpeg, .png)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Inference device (cuda or cpu)
        #[arg(short, long, default_value = "cpu")]
        device: Device,
        /// Maximum generated caption tokens
        #[arg(long, default_value_t = snapfind_core::DEFAULT_MAX_NEW_TOKENS)]
        max_new_tokens: usize,
    },
    /// List stored images
    List,
    /// List stored images whose names contain every keyword
    Search {
        /// Keywords (case-insensitive)
        query: Vec<String>,
    },
    /// Delete a stored image by file name
    Delete {
        /// File name as shown by `list`
        name: String,
    },
    /// Show store and model status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = FileStore::open(&cli.store_dir)?;

    match cli.command {
        Commands::Caption {
            files,
            device,
            max_new_tokens,
        } => {
            let opts = ModelOptions {
                max_new_tokens,
                ..ModelOptions::new(&cli.model_dir, device)
            };
            let mut model = CaptionModel::load(&opts)
                .with_context(|| format!("loading caption model on {device}"))?;
            tracing::info!(device = %model.device(), dir = %cli.model_dir.display(), "model ready");

            let total = files.len();
            let mut saved = 0;
            for (i, path) in files.iter().enumerate() {
                match caption_file(&mut model, &store, path) {
                    Ok(stored) => {
                        saved += 1;
                        println!("{} -> {}", path.display(), stored.file_name);
                    }
                    Err(e) => eprintln!("{}: {e:#}", path.display()),
                }
                tracing::debug!(done = i + 1, total, "caption progress");
            }
            println!("{saved}/{total} images processed");
        }
        Commands::List => print_images(&store.list()?),
        Commands::Search { query } => {
            let matches = snapfind_store::filter(&query.join(" "), store.list()?);
            print_images(&matches);
        }
        Commands::Delete { name } => {
            if store.delete(&name)? {
                println!("Deleted {name}");
            } else {
                println!("{name} was already gone");
            }
        }
        Commands::Status => {
            let model_files: Vec<&str> = ["encoder_model.onnx", "decoder_model.onnx", "tokenizer.json"]
                .into_iter()
                .filter(|f| cli.model_dir.join(f).exists() || cli.model_dir.join("onnx").join(f).exists())
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "store_dir": store.dir().display().to_string(),
                    "images": store.list()?.len(),
                    "model_dir": cli.model_dir.display().to_string(),
                    "model_files": model_files,
                })
            );
        }
    }

    Ok(())
}

fn caption_file(model: &mut CaptionModel, store: &FileStore, path: &Path) -> Result<StoredImage> {
    check_extension(path)?;
    let image = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    let caption = model.caption(&image)?;
    Ok(store.save(&image, &caption)?)
}

/// Only .jpg, .jpeg and .png files are captioned.
fn check_extension(path: &Path) -> Result<()> {
    let accepted = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(snapfind_store::has_image_extension);
    anyhow::ensure!(accepted, "only .jpg, .jpeg and .png files are accepted");
    Ok(())
}

fn print_images(images: &[StoredImage]) {
    if images.is_empty() {
        println!("No images found.");
        return;
    }
    for image in images {
        match &image.caption {
            Some(caption) => println!("{}\t{caption}", image.file_name),
            None => println!("{}", image.file_name),
        }
    }
}
