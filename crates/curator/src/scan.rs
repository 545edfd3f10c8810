use std::path::PathBuf;
use std::time::Duration;

use library::{scan, Clusterer, ScanMode, ScanOptions};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gemini::GeminiClient;
use crate::state::{AdmissionError, AppState, ScanStatus};
use crate::verify::{AiVerifier, VerifyOptions};

/// Rebuilds the working set from the cache, ordered by search text.
pub fn load_working_set(state: &AppState) -> Result<usize, library::StoreError> {
    let files = state.store.load_sorted_by_search_text()?;
    let count = files.len();
    state.working.write().files = files;
    Ok(count)
}

/// Recomputes candidate groups from the working set without touching the disk.
pub fn regroup(state: &AppState) -> usize {
    let threshold = state.config.read().cluster_threshold;
    let files = state.working.read().files.clone();
    let candidates = Clusterer::new(threshold).cluster(&files);
    let count = candidates.len();
    state.working.write().candidates = candidates;
    count
}

/// Scans `target` (a subtree) or the whole music directory, then clusters the working set.
pub fn start_scan(
    state: &AppState,
    target: Option<PathBuf>,
) -> Result<JoinHandle<()>, AdmissionError> {
    state.begin(ScanStatus::Scanning, "Scan started")?;

    let (root, mode) = match target {
        Some(path) => (path, ScanMode::Subtree),
        None => (state.music_dir(), ScanMode::Full),
    };
    {
        let mut working = state.working.write();
        match mode {
            ScanMode::Full => working.files.clear(),
            ScanMode::Subtree => working.prune_under(&root),
        }
        working.candidates.clear();
        working.results.clear();
    }
    let (batch_size, threshold) = {
        let config = state.config.read();
        (config.scan_batch_size, config.cluster_threshold)
    };
    info!("Scanning {:?} ({:?})", root, mode);

    let state = state.clone();
    Ok(tokio::spawn(async move {
        let job_state = state.clone();
        let result = tokio::task::spawn_blocking(move || {
            let state = job_state;
            let summary = scan(
                &state.store,
                &root,
                mode,
                ScanOptions { batch_size },
                |batch, count| {
                    state.working.write().files.extend_from_slice(batch);
                    state.set_progress(count, 0, format!("Scanned {} files...", count));
                },
            )?;

            let files = state.working.read().files.clone();
            let total = files.len();
            state.set_progress(0, total, format!("Scan finished with {} files, grouping...", total));
            let candidates = Clusterer::new(threshold).cluster_with_progress(&files, |idx| {
                if idx % 500 == 0 {
                    state.scan.write().progress = idx;
                }
            });
            Ok::<_, library::StoreError>((summary, total, candidates))
        })
        .await;

        match result {
            Ok(Ok((summary, total, candidates))) => {
                let groups = candidates.len();
                state.working.write().candidates = candidates;
                if summary.failed_batches > 0 {
                    warn!("{} scan batches were not persisted", summary.failed_batches);
                }
                let message = format!(
                    "Scan complete: {} files, {} suspected duplicate groups",
                    total, groups
                );
                info!("{}", message);
                state.set_progress(total, total, message.clone());
                state.finish(ScanStatus::Idle, message);
            }
            Ok(Err(err)) => {
                warn!("Scan failed: {}", err);
                state.finish(ScanStatus::Error, format!("Scan failed: {}", err));
            }
            Err(err) => {
                warn!("Scan join error: {}", err);
                state.finish(ScanStatus::Error, format!("Scan failed: {}", err));
            }
        }
    }))
}

/// Sends the current candidate groups to the classifier and stores the confirmations.
pub fn start_analysis(state: &AppState) -> Result<JoinHandle<()>, AdmissionError> {
    let (api_key, model, options) = {
        let config = state.config.read();
        let options = VerifyOptions {
            batch_size: config.verify_batch_size,
            max_group_members: config.verify_max_group_members,
            max_batch_members: config.verify_max_batch_members,
            delay: Duration::from_millis(config.verify_delay_ms),
        };
        (config.api_key.clone(), config.model_name.clone(), options)
    };
    let classifier = match GeminiClient::new(state.client(), &api_key, &model) {
        Ok(classifier) => classifier,
        Err(err) => {
            warn!("Analysis unavailable: {}", err);
            return Err(AdmissionError::MissingApiKey);
        }
    };
    state.begin(ScanStatus::Analyzing, "Analysis started")?;

    let candidates = {
        let mut working = state.working.write();
        working.results.clear();
        working.candidates.clone()
    };
    info!(
        "Analyzing {} candidate groups with {}",
        candidates.len(),
        model
    );

    let state = state.clone();
    Ok(tokio::spawn(async move {
        let verifier = AiVerifier::new(classifier, options);
        let progress_state = state.clone();
        let results = verifier
            .verify(candidates, move |done, total| {
                progress_state.set_progress(
                    done,
                    total,
                    format!("Asking {} ... batch {}/{}", model, done, total),
                );
            })
            .await;

        let message = format!("Analysis complete: {} confirmed duplicate groups", results.len());
        state.working.write().results = results;
        info!("{}", message);
        state.finish(ScanStatus::Done, message);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::state_in;
    use std::fs;

    fn touch(path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"junk").unwrap();
    }

    #[tokio::test]
    async fn full_scan_groups_similar_names() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        touch(&music.join("a/Queen - Bohemian Rhapsody.mp3"));
        touch(&music.join("b/Queen - Bohemian Rhapsody.flac"));
        touch(&music.join("c/Nirvana - Lithium.mp3"));

        start_scan(&state, None).unwrap().await.unwrap();

        let scan = state.scan_state();
        assert_eq!(scan.status, ScanStatus::Idle);
        let working = state.working.read();
        assert_eq!(working.files.len(), 3);
        assert_eq!(working.candidates.len(), 1);
        assert_eq!(working.candidates[0].len(), 2);
        assert_eq!(state.store.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn subtree_scans_keep_other_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let music = state.music_dir();
        touch(&music.join("X/one.mp3"));
        touch(&music.join("X/two.mp3"));
        touch(&music.join("Y/three.mp3"));

        start_scan(&state, Some(music.join("X"))).unwrap().await.unwrap();
        start_scan(&state, Some(music.join("Y"))).unwrap().await.unwrap();
        assert_eq!(state.working.read().files.len(), 3);
        assert_eq!(state.store.count().unwrap(), 3);

        start_scan(&state, Some(music.join("X"))).unwrap().await.unwrap();
        assert_eq!(state.working.read().files.len(), 3);
    }

    #[tokio::test]
    async fn analysis_requires_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let result = start_analysis(&state);
        assert!(matches!(result, Err(AdmissionError::MissingApiKey)));
        assert_eq!(state.scan_state().status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn scan_is_rejected_while_analyzing() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.begin(ScanStatus::Analyzing, "busy").unwrap();
        assert!(matches!(
            start_scan(&state, None),
            Err(AdmissionError::Busy(ScanStatus::Analyzing))
        ));
    }

    #[test]
    fn working_set_loads_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state
            .store
            .upsert_batch(&[
                crate::state::testing::record("/m/2/Lithium.mp3"),
                crate::state::testing::record("/m/1/Lithium.mp3"),
                crate::state::testing::record("/m/0/Breed.flac"),
            ])
            .unwrap();
        assert_eq!(load_working_set(&state).unwrap(), 3);
        {
            let working = state.working.read();
            assert_eq!(working.files[0].path, "/m/0/Breed.flac");
            assert_eq!(working.files[1].path, "/m/1/Lithium.mp3");
        }
        assert_eq!(regroup(&state), 1);
        let working = state.working.read();
        let paths: Vec<&str> = working.candidates[0].files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/m/1/Lithium.mp3", "/m/2/Lithium.mp3"]);
    }
}
