use std::collections::BTreeSet;

use common::{CandidateGroup, FileRecord};

pub const DEFAULT_THRESHOLD: u8 = 80;
pub const DEFAULT_MIN_GROUP_SIZE: usize = 2;

/// Groups records whose search text is near-identical to the group's first member.
#[derive(Debug, Clone, Copy)]
pub struct Clusterer {
    pub threshold: u8,
    pub min_group_size: usize,
}

impl Default for Clusterer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
        }
    }
}

impl Clusterer {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    pub fn cluster(&self, records: &[FileRecord]) -> Vec<CandidateGroup> {
        self.cluster_with_progress(records, |_| {})
    }

    /// Same as [`Clusterer::cluster`]; `on_progress` gets the index of each visited record.
    pub fn cluster_with_progress<F>(&self, records: &[FileRecord], mut on_progress: F) -> Vec<CandidateGroup>
    where
        F: FnMut(usize),
    {
        let mut sorted: Vec<&FileRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.search_text.cmp(&b.search_text));

        let mut groups = Vec::new();
        let mut iter = sorted.into_iter();
        let mut current: Vec<&FileRecord> = match iter.next() {
            Some(first) => vec![first],
            None => return groups,
        };

        for (idx, record) in iter.enumerate() {
            on_progress(idx + 1);
            let anchor = current[0];
            if token_set_ratio(&anchor.search_text, &record.search_text) > self.threshold {
                current.push(record);
            } else {
                self.emit(&mut groups, &current);
                current = vec![record];
            }
        }
        self.emit(&mut groups, &current);
        groups
    }

    fn emit(&self, groups: &mut Vec<CandidateGroup>, members: &[&FileRecord]) {
        if members.len() >= self.min_group_size.max(2) {
            groups.push(CandidateGroup::new(members.iter().map(|r| (*r).clone()).collect()));
        }
    }
}

/// Order-insensitive token similarity in `0..=100`.
pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0;
    }

    let intersection: Vec<&str> = tokens_a.intersection(&tokens_b).map(String::as_str).collect();
    let only_a: Vec<&str> = tokens_a.difference(&tokens_b).map(String::as_str).collect();
    let only_b: Vec<&str> = tokens_b.difference(&tokens_a).map(String::as_str).collect();

    if !intersection.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 100;
    }

    let t0 = intersection.join(" ");
    let t1 = join_nonempty(&t0, &only_a.join(" "));
    let t2 = join_nonempty(&t0, &only_b.join(" "));

    ratio(&t0, &t1).max(ratio(&t0, &t2)).max(ratio(&t1, &t2))
}

fn tokenize(value: &str) -> BTreeSet<String> {
    let normalized: String = value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    normalized.split_whitespace().map(str::to_string).collect()
}

fn join_nonempty(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{} {}", head, tail),
    }
}

fn ratio(a: &str, b: &str) -> u8 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 100;
    }
    let score = 200.0 * lcs_len(&a, &b) as f64 / total as f64;
    score.round_ties_even() as u8
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}
