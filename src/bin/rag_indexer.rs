use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use walkdir::WalkDir;

use workspace_rag::bootstrap::{init_tracing, Components};
use workspace_rag::indexer::extractor::SupportedFormat;
use workspace_rag::models::Namespace;
use workspace_rag::rag::pipeline::IngestPipeline;
use workspace_rag::settings::Settings;
use workspace_rag::storage::ObjectStore;

#[derive(Parser, Debug)]
#[command(name = "rag-indexer")]
#[command(about = "Upload a directory of documents into a workspace and index them")]
struct Args {
    /// Directory to recursively index
    #[arg(short, long)]
    dir: PathBuf,

    /// Target workspace id
    #[arg(short, long)]
    workspace: String,

    /// Vector index collection (overrides configuration)
    #[arg(long)]
    collection: Option<String>,

    /// Maximum chunk size in characters (overrides configuration)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks in characters (overrides configuration)
    #[arg(long)]
    chunk_overlap: Option<usize>,
}

/// Object names are flat, so nested paths are joined with `_`.
fn object_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("_"))
}

fn walk_directory(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .and_then(SupportedFormat::from_extension)
                .is_some()
        })
        .collect()
}

async fn process_file(
    root: &Path,
    path: &Path,
    namespace: &Namespace,
    store: &dyn ObjectStore,
    pipeline: &IngestPipeline,
) -> Result<usize> {
    let name = object_name(root, path)
        .ok_or_else(|| anyhow::anyhow!("cannot derive object name for {}", path.display()))?;
    let bytes = tokio::fs::read(path).await?;
    let key = store.put(namespace, &name, bytes).await?;
    Ok(pipeline.ingest(namespace.as_str(), &key).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();

    if !args.dir.exists() {
        anyhow::bail!("Directory does not exist: {}", args.dir.display());
    }
    let namespace = Namespace::for_workspace(&args.workspace)?;

    let mut settings = Settings::load()?;
    if let Some(collection) = args.collection.clone() {
        settings.vector_index.collection = collection;
    }
    if let Some(size) = args.chunk_size {
        settings.chunking.chunk_size = size;
    }
    if let Some(overlap) = args.chunk_overlap {
        settings.chunking.chunk_overlap = overlap;
    }
    settings.validate()?;

    println!("Connecting to {:?} vector index...", settings.vector_index.backend);
    let components = Components::build(&settings).await?;
    let pipeline = components.pipeline(&settings);

    println!("Scanning directory: {}", args.dir.display());
    let files = walk_directory(&args.dir);
    println!("Found {} supported files", files.len());

    if files.is_empty() {
        println!("No supported files found. Exiting.");
        return Ok(());
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut success_count = 0usize;
    let mut total_chunks = 0usize;
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();

    for path in &files {
        pb.set_message(format!("{}", path.file_name().unwrap_or_default().to_string_lossy()));

        match process_file(&args.dir, path, &namespace, components.store.as_ref(), &pipeline).await {
            Ok(chunk_count) => {
                success_count += 1;
                total_chunks += chunk_count;
            }
            Err(e) => {
                tracing::warn!("Failed to process {}: {}", path.display(), e);
                failed_files.push((path.clone(), format!("{}", e)));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    println!("\nIndexing complete!");
    println!("  Files processed: {}/{}", success_count, files.len());
    println!("  Files failed:    {}", failed_files.len());
    println!("  Total chunks:    {}", total_chunks);
    println!("  Workspace:       {}", namespace);
    println!("  Collection:      {}", settings.vector_index.collection);

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_flattens_nested_paths() {
        let root = Path::new("/docs");
        assert_eq!(
            object_name(root, Path::new("/docs/guides/setup.md")).as_deref(),
            Some("guides_setup.md")
        );
        assert_eq!(object_name(root, Path::new("/docs/a.txt")).as_deref(), Some("a.txt"));
        assert_eq!(object_name(root, Path::new("/docs")), None);
    }
}
