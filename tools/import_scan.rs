use std::env;
use std::path::PathBuf;

use library::{scan, Clusterer, MetadataStore, ScanMode, ScanOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_DIR").ok())
        .ok_or("MUSIC_DIR not set and no path argument")?;
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/metadata.redb".to_string());

    let store = MetadataStore::open(&PathBuf::from(&index_path))?;
    let summary = scan(
        &store,
        &PathBuf::from(&music_root),
        ScanMode::Full,
        ScanOptions::default(),
        |_, count| info!("Scanned {} files...", count),
    )?;

    let files = store.load_sorted_by_search_text()?;
    let groups = Clusterer::default().cluster(&files);
    for group in &groups {
        println!("--- {}", group.token());
        for file in &group.files {
            println!("    {}", file.path);
        }
    }

    println!(
        "Indexed {} files in {} batches ({} failed), {} suspected duplicate groups",
        summary.files,
        summary.batches,
        summary.failed_batches,
        groups.len()
    );
    Ok(())
}
